use crate::core::config::ConfigError;
use crate::core::errors::KiwoomError;
use crate::core::kernel::exponential_backoff;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, instrument};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Realtime connection configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Time allowed for the login acknowledgement in milliseconds
    pub login_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Time allowed for a pong after each ping in milliseconds
    pub pong_timeout_ms: u64,
    /// Max consecutive reconnection attempts before the session gives up
    pub max_reconnect_attempts: u32,
    /// First reconnection delay in milliseconds
    pub reconnect_delay_ms: u64,
    /// Upper bound for a single reconnection delay in milliseconds
    pub max_reconnect_delay_ms: u64,
    /// Time a connection must stay live before its loss restarts the
    /// reconnection budget, in milliseconds
    pub stable_after_ms: u64,
    /// Time allowed for background tasks to stop on close, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,    // 10 seconds
            login_timeout_ms: 10_000,      // 10 seconds
            heartbeat_interval_ms: 30_000, // 30 seconds
            pong_timeout_ms: 10_000,       // 10 seconds
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,      // 1 second
            max_reconnect_delay_ms: 60_000, // 1 minute
            stable_after_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl WsConfig {
    /// Set the heartbeat interval and pong timeout
    pub fn with_heartbeat(mut self, interval: Duration, pong_timeout: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self.pong_timeout_ms = pong_timeout.as_millis() as u64;
        self
    }

    /// Set the reconnection policy
    pub fn with_reconnect(mut self, max_attempts: u32, base: Duration, max: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay_ms = base.as_millis() as u64;
        self.max_reconnect_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set how long a connection must stay live to count as recovered
    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after_ms = stable_after.as_millis() as u64;
        self
    }

    /// Set the login acknowledgement timeout
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the close deadline
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reject settings the session cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.pong_timeout_ms == 0 || self.pong_timeout_ms >= self.heartbeat_interval_ms {
            return Err(ConfigError::InvalidConfiguration(format!(
                "pong timeout ({}ms) must be positive and shorter than the heartbeat interval ({}ms)",
                self.pong_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(ConfigError::InvalidConfiguration(
                "reconnect delay exceeds its maximum".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Delays between consecutive reconnection attempts
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        exponential_backoff(self.reconnect_delay_ms, self.max_reconnect_delay_ms)
    }
}

/// WebSocket session trait - pure transport layer
#[async_trait]
pub trait WsSession: Send + Sync {
    /// Connect to the WebSocket
    async fn connect(&mut self) -> Result<(), KiwoomError>;

    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), KiwoomError>;

    /// Receive the next raw message
    ///
    /// Must be cancel-safe: the session races it against its timers.
    async fn next_raw(&mut self) -> Option<Result<Message, KiwoomError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), KiwoomError>;

    /// Check if the connection is alive
    fn is_connected(&self) -> bool;
}

/// Traffic counters of one connection
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Tungstenite-based WebSocket implementation
pub struct TungsteniteWs {
    url: String,
    write: Option<SplitSink<WsStream, Message>>,
    read: Option<SplitStream<WsStream>>,
    connected: bool,
    venue_name: String,
    config: WsConfig,
    connection_stats: ConnectionStats,
}

impl TungsteniteWs {
    /// Create a new WebSocket session
    ///
    /// # Arguments
    /// * `url` - The WebSocket URL to connect to
    /// * `venue_name` - Name of the venue for logging/tracing
    pub fn new(url: String, venue_name: String) -> Self {
        Self {
            url,
            write: None,
            read: None,
            connected: false,
            venue_name,
            config: WsConfig::default(),
            connection_stats: ConnectionStats::default(),
        }
    }

    /// Set custom WebSocket configuration
    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.connection_stats
    }

    fn record_sent(&mut self, msg: &Message) {
        self.connection_stats.messages_sent += 1;
        self.connection_stats.bytes_sent += msg.len() as u64;
    }
}

#[async_trait]
impl WsSession for TungsteniteWs {
    #[instrument(skip(self), fields(venue = %self.venue_name, url = %self.url))]
    async fn connect(&mut self) -> Result<(), KiwoomError> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| {
                KiwoomError::ConnectionTimeout("WebSocket connection timeout".to_string())
            })?
            .map_err(|e| {
                KiwoomError::NetworkError(format!("WebSocket connection failed: {}", e))
            })?;

        let (write, read) = ws_stream.split();
        self.write = Some(write);
        self.read = Some(read);
        self.connected = true;

        debug!("websocket connected");
        Ok(())
    }

    async fn send_raw(&mut self, msg: Message) -> Result<(), KiwoomError> {
        if !self.connected {
            return Err(KiwoomError::NotConnected(
                "WebSocket not connected".to_string(),
            ));
        }

        self.record_sent(&msg);

        let write = self.write.as_mut().ok_or_else(|| {
            KiwoomError::NetworkError("WebSocket write stream not available".to_string())
        })?;

        if let Err(e) = write.send(msg).await {
            self.connected = false;
            return Err(KiwoomError::NetworkError(format!(
                "Failed to send WebSocket message: {}",
                e
            )));
        }

        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<Message, KiwoomError>> {
        if !self.connected {
            return Some(Err(KiwoomError::NotConnected(
                "WebSocket not connected".to_string(),
            )));
        }

        let read = self.read.as_mut()?;

        // Transport pings are answered by tungstenite itself on the next flush
        match read.next().await {
            Some(Ok(message)) => {
                self.connection_stats.messages_received += 1;
                self.connection_stats.bytes_received += message.len() as u64;
                if matches!(message, Message::Close(_)) {
                    self.connected = false;
                }
                Some(Ok(message))
            }
            Some(Err(e)) => {
                self.connected = false;
                Some(Err(KiwoomError::NetworkError(format!(
                    "WebSocket error: {}",
                    e
                ))))
            }
            None => {
                self.connected = false;
                None
            }
        }
    }

    #[instrument(skip(self), fields(venue = %self.venue_name))]
    async fn close(&mut self) -> Result<(), KiwoomError> {
        if let Some(write) = self.write.as_mut() {
            let _ = write.send(Message::Close(None)).await;
        }
        self.connected = false;
        self.write = None;
        self.read = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Tracks the outstanding transport ping of one connection
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    ping_sent_at: Option<Instant>,
    last_pong: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ping; returns false if the previous one is still unanswered
    pub fn record_ping(&mut self) -> bool {
        if self.ping_sent_at.is_some() {
            return false;
        }
        self.ping_sent_at = Some(Instant::now());
        true
    }

    pub fn record_pong(&mut self) {
        self.ping_sent_at = None;
        self.last_pong = Some(Instant::now());
    }

    pub fn awaiting_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// When the outstanding ping expires
    pub fn pong_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.ping_sent_at.map(|sent| sent + timeout)
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }
}
