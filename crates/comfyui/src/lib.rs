//! ComfyUI realtime execution-tracking client.
//!
//! Provides the realtime frame codec, session identity, the transport
//! manager with fixed-delay reconnect and polling fallback, the REST
//! request channel, and the execution tracker that turns the message
//! stream into lifecycle events for one submitted run at a time.
//! [`bridge::ComfyBridge`] ties them together.

pub mod api;
pub mod bridge;
pub mod client;
pub mod config;
pub mod events;
pub mod manager;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod session;
pub mod tracker;
