use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KiwoomError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Group '{group}' would hold {requested} items (max {max})")]
    CapacityExceeded {
        group: String,
        requested: usize,
        max: usize,
    },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    #[error("API error: {code} - {message}")]
    ApiError { code: i64, message: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] crate::core::config::ConfigError),
}

impl KiwoomError {
    /// Faults that are retried (REST) or trigger the reconnect policy (socket).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_) | Self::ConnectionTimeout(_) | Self::ServerError { .. }
        )
    }

    /// Faults that must cross the engine boundary and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthError(_) | Self::ConnectionLost { .. })
    }
}
