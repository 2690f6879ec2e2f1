use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Reqwest HTTP error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Backend rejected request: {0}")]
    Backend(String),

    #[error("Not connected to the collaboration server")]
    NotConnected,

    #[error("Malformed payload for '{event}': {reason}")]
    MalformedPayload { event: String, reason: String },

    #[error("Unknown {kind} action: {action}")]
    UnknownAction { kind: &'static str, action: String },

    #[error("Invalid resource key: {0}")]
    InvalidResourceKey(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl SyncError {
    pub fn malformed(event: &str, reason: impl Into<String>) -> Self {
        SyncError::MalformedPayload {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
