//! Upstream Feed
//!
//! Maintains the push connection to the provider's block notification
//! WebSocket. Subscribes on connect, keeps the link alive with periodic pings,
//! forwards new block hashes to the relay and reconnects forever after a fixed
//! delay when the connection drops.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Default push notification endpoint
pub const DEFAULT_WS_URL: &str = "wss://mempool.space/api/v1/ws";

/// Request sent right after connecting
pub const SUBSCRIBE_REQUEST: &str = r#"{"action":"want","data":["blocks"]}"#;

/// Keepalive frame
pub const PING_PAYLOAD: &str = "ping";

/// Keepalive interval in milliseconds
pub const PING_INTERVAL_MS: u64 = 25_000;

/// Reconnect delay after the connection closes, in milliseconds
pub const RECONNECT_AFTER_CLOSE_MS: u64 = 3_000;

/// Reconnect delay after a failed connect, in milliseconds
pub const RECONNECT_AFTER_FAILURE_MS: u64 = 5_000;

/// Errors that end an upstream session
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl UpstreamError {
    /// Whether the error happened before a connection was established
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, UpstreamError::ConnectionFailed(_))
    }
}

/// State of the upstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Subscribed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed reconnect delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub after_close: Duration,
    pub after_connect_failure: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            after_close: Duration::from_millis(RECONNECT_AFTER_CLOSE_MS),
            after_connect_failure: Duration::from_millis(RECONNECT_AFTER_FAILURE_MS),
        }
    }
}

impl ReconnectPolicy {
    /// No delay at all, for tests
    pub fn immediate() -> Self {
        Self {
            after_close: Duration::ZERO,
            after_connect_failure: Duration::ZERO,
        }
    }

    /// Delay before the next attempt given how the last session ended
    pub fn delay_for(&self, outcome: &Result<(), UpstreamError>) -> Duration {
        match outcome {
            Err(e) if e.is_connect_failure() => self.after_connect_failure,
            _ => self.after_close,
        }
    }
}

/// Configuration for the upstream feed
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            ping_interval: Duration::from_millis(PING_INTERVAL_MS),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl UpstreamConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Nested block object of a notification
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct NotifiedBlock {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Block notification in any of the shapes the provider uses
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct BlockNotification {
    #[serde(default)]
    pub block: Option<NotifiedBlock>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl BlockNotification {
    /// Block hash with precedence `block.hash`, `block.id`, `hash`, `id`
    pub fn block_hash(self) -> Option<String> {
        let nested = self.block.unwrap_or_default();
        [nested.hash, nested.id, self.hash, self.id]
            .into_iter()
            .flatten()
            .find(|h| !h.is_empty())
    }
}

/// Extract a block hash from a raw notification frame
pub fn parse_block_hash(text: &str) -> Option<String> {
    serde_json::from_str::<BlockNotification>(text)
        .ok()
        .and_then(BlockNotification::block_hash)
}

/// Upstream connection manager
pub struct UpstreamFeed {
    config: UpstreamConfig,
    state: watch::Sender<ConnectionState>,
    notifications: mpsc::UnboundedSender<String>,
    sessions: u64,
}

impl UpstreamFeed {
    /// Create a feed forwarding block hashes to `notifications`
    ///
    /// The returned receiver observes the connection state.
    pub fn new(
        config: UpstreamConfig,
        notifications: mpsc::UnboundedSender<String>,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let feed = Self {
            config,
            state,
            notifications,
            sessions: 0,
        };
        (feed, state_rx)
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of connection attempts made so far
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Shutdown requested, shutdown handle dropped, or nobody consuming notifications
    fn should_stop(&self, shutdown: &watch::Receiver<bool>) -> bool {
        *shutdown.borrow() || shutdown.has_changed().is_err() || self.notifications.is_closed()
    }

    /// Run until `shutdown` flips to true or the notification receiver is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if self.should_stop(&shutdown) {
                break;
            }

            self.sessions += 1;
            let outcome = self.run_session(&mut shutdown).await;
            self.set_state(ConnectionState::Disconnected);

            match &outcome {
                Ok(()) => info!("Upstream connection closed"),
                Err(e) => error!("Upstream connection error: {}", e),
            }

            if self.should_stop(&shutdown) {
                break;
            }

            let delay = self.config.reconnect.delay_for(&outcome);
            debug!("Reconnecting to upstream in {:?}", delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Upstream feed stopped");
    }

    /// One connect-subscribe-read cycle
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), UpstreamError> {
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to upstream feed at {}", self.config.url);

        let (ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| UpstreamError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(SUBSCRIBE_REQUEST.to_string()))
            .await
            .map_err(|e| UpstreamError::SubscriptionFailed(e.to_string()))?;
        self.set_state(ConnectionState::Subscribed);
        info!("Subscribed to upstream block notifications");

        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    sink.send(Message::Text(PING_PAYLOAD.to_string()))
                        .await
                        .map_err(|e| UpstreamError::Stream(e.to_string()))?;
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text),
                        Some(Ok(Message::Binary(bytes))) => {
                            if let Ok(text) = std::str::from_utf8(&bytes) {
                                self.dispatch(text);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(UpstreamError::Stream(e.to_string())),
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let Some(hash) = parse_block_hash(text) else {
            debug!("Ignoring upstream frame without block hash ({} bytes)", text.len());
            return;
        };
        debug!("Upstream announced block {}", hash);
        if self.notifications.send(hash).is_err() {
            warn!("Notification receiver dropped");
        }
    }
}
