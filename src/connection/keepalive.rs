//! Keepalive scheduling and connection liveness.
//!
//! Both peers run a fixed-interval timer sending KEEPALIVE frames with
//! the respond flag set; the receiver echoes them back with the flag
//! cleared. Interval and max-lifetime are exchanged once in SETUP and
//! fixed for the connection lifetime. Going longer than the max lifetime
//! without receiving a keepalive is fatal to the whole connection, not
//! just one stream.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ErrorCode, RSocketError, Result};
use crate::frame::{Frame, KeepAliveFrame};

use super::queue::FrameQueue;

/// Keepalive timings, fixed at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// How often a KEEPALIVE frame is sent.
    pub interval: Duration,
    /// Silence longer than this fails the connection.
    pub max_lifetime: Duration,
}

impl KeepAliveConfig {
    pub fn new(interval: Duration, max_lifetime: Duration) -> Self {
        Self {
            interval,
            max_lifetime,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            max_lifetime: Duration::from_secs(90),
        }
    }
}

/// Tracks when the last keepalive was received from the peer.
#[derive(Debug)]
pub(crate) struct KeepAliveState {
    last_received: Mutex<Instant>,
}

impl KeepAliveState {
    pub fn new() -> Self {
        Self {
            last_received: Mutex::new(Instant::now()),
        }
    }

    /// Record an inbound KEEPALIVE frame.
    pub fn mark_received(&self) {
        *self.last_received.lock().unwrap() = Instant::now();
    }

    /// Time since the peer last proved liveness.
    pub fn silence(&self) -> Duration {
        self.last_received.lock().unwrap().elapsed()
    }
}

/// Repeating keepalive timer for one connection.
///
/// Sends a respond-flagged KEEPALIVE every interval and returns an error
/// once the peer has been silent past the max lifetime; the caller turns
/// that into connection failure.
pub(crate) async fn keepalive_loop(
    config: KeepAliveConfig,
    state: std::sync::Arc<KeepAliveState>,
    queue: FrameQueue,
) -> Result<()> {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let silence = state.silence();
        if silence > config.max_lifetime {
            return Err(RSocketError::Connection {
                code: ErrorCode::CONNECTION_ERROR,
                message: format!(
                    "keep-alive failed: no keep-alive received for {}ms (max lifetime {}ms)",
                    silence.as_millis(),
                    config.max_lifetime.as_millis()
                ),
            });
        }
        queue
            .send(Frame::KeepAlive(KeepAliveFrame {
                respond: true,
                last_position: 0,
                data: Bytes::new(),
            }))
            .await?;
    }
}
