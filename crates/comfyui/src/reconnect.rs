//! Fixed-delay reconnection and the polling fallback.
//!
//! A channel that closes is rebuilt after [`ReconnectConfig::reconnect_delay`]
//! with no backoff and no retry limit. A channel that fails before it ever
//! opened is abandoned in favour of [`poll_loop`], which keeps status
//! flowing through the request channel until the transport is shut down.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::events::TransportEvent;
use crate::messages::{InboundMessage, StatusData};

/// Default pause before rebuilding a closed channel.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(300);

/// Default period of the polling fallback.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Timing of reconnect attempts and status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Period of `GET /prompt` polling once the fallback is active.
    pub poll_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Sleep for the reconnect delay.
///
/// Returns `false` if `cancel` fired first.
pub async fn wait_reconnect_delay(config: &ReconnectConfig, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(config.reconnect_delay) => true,
    }
}

/// Poll `GET /prompt` every `interval` until cancelled.
///
/// Each tick broadcasts a `Status` message: the polled queue status on
/// success, a null status on failure. The first tick fires one full
/// interval after the loop starts.
pub async fn poll_loop(
    api: &ComfyUIApi,
    event_tx: &broadcast::Sender<TransportEvent>,
    interval: Duration,
    cancel: &CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(polls, "Status polling stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        polls += 1;
        let status = tokio::select! {
            _ = cancel.cancelled() => return,
            result = api.get_status() => match result {
                Ok(queue) => StatusData::from_queue(queue),
                Err(e) => {
                    tracing::debug!(attempt = polls, error = %e, "Status poll failed");
                    StatusData::disconnected()
                }
            },
        };

        let _ = event_tx.send(TransportEvent::Message(InboundMessage::Status(status)));
    }
}
