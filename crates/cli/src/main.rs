//! `promptwatch` -- submit a workflow and follow it to completion.
//!
//! With a workflow path, validates and runs it, printing each lifecycle
//! event as a JSON line. Exits non-zero when the run fails. Without a path,
//! prints transport events until Ctrl-C.
//!
//! Configuration is read from the environment (and `.env`); see
//! `ClientConfig::from_env` for the variables.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use promptwatch_cli::{lifecycle_line, transport_line, WorkflowFile};
use promptwatch_comfyui::bridge::ComfyBridge;
use promptwatch_comfyui::config::ClientConfig;
use promptwatch_comfyui::events::LifecycleEvent;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "promptwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(std::env::args_os().nth(1).map(PathBuf::from)).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "promptwatch failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(workflow_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = ClientConfig::from_env()?;
    tracing::info!(api_url = %config.api_url, ws_url = %config.ws_url, "Starting promptwatch");

    let workflow = workflow_path.as_deref().map(WorkflowFile::load).transpose()?;

    let bridge = ComfyBridge::start(&config).await;
    if let Some(ref token) = config.user_token {
        bridge
            .api()
            .authenticate(token)
            .await
            .context("authenticating")?;
    }

    let code = match workflow {
        Some(workflow) => track(&bridge, workflow).await,
        None => watch(&bridge).await,
    };

    bridge.shutdown().await;
    code
}

/// Submit `workflow` and print lifecycle events until it finishes.
async fn track(bridge: &ComfyBridge, workflow: WorkflowFile) -> anyhow::Result<ExitCode> {
    let mut events = bridge.subscribe_lifecycle();
    let queued = bridge
        .submit_and_track(&workflow.output, workflow.workflow)
        .await
        .context("submitting workflow")?;
    tracing::info!(prompt_id = %queued.prompt_id, nodes = queued.node_ids.len(), "Tracking");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(ExitCode::FAILURE);
            }
            recv = events.recv() => recv,
        };

        match event {
            Ok(event) => {
                println!("{}", lifecycle_line(&event)?);
                match event {
                    LifecycleEvent::ExecuteComplete { .. } => return Ok(ExitCode::SUCCESS),
                    LifecycleEvent::ExecuteError { .. } => return Ok(ExitCode::FAILURE),
                    _ => {}
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Output fell behind lifecycle events");
            }
            Err(RecvError::Closed) => anyhow::bail!("lifecycle channel closed"),
        }
    }
}

/// Print transport events until Ctrl-C.
async fn watch(bridge: &ComfyBridge) -> anyhow::Result<ExitCode> {
    let mut events = bridge.subscribe_transport();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(ExitCode::SUCCESS),
            recv = events.recv() => match recv {
                Ok(event) => println!("{}", transport_line(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind transport events");
                }
                Err(RecvError::Closed) => return Ok(ExitCode::SUCCESS),
            },
        }
    }
}
