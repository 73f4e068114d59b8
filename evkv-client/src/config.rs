//! # Client Configuration

use std::time::Duration;

use serde::Deserialize;

/// Fixed delay between a lost or failed connection and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the client and its bundled TCP transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Single-shot delay before reconnecting. Never grows between attempts.
    pub reconnect_delay: Duration,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Disable Nagle on the TCP socket.
    pub nodelay: bool,
    /// Buffered `connected`/`disconnected` notifications per subscriber.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: None,
            nodelay: true,
            event_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}
