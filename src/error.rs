use std::time::Duration;
use thiserror::Error;

/// Failures that abort `connect()` before the session is usable.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("No API key configured. Set GEMINI_API_KEY or pass one to the builder.")]
    MissingCredential,

    #[error("Microphone access denied: {0}")]
    DevicePermission(String),

    #[error("Media devices are unavailable in this context: {0}")]
    Restricted(String),

    #[error("Timed out opening the session after {0:?}")]
    Timeout(Duration),
}

/// Errors raised by capability providers. They never escape the tool dispatcher.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("No directory connected. Ask the user to connect a folder first.")]
    NoDirectory,

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid time '{0}'. Use an ISO 8601 timestamp such as 2025-01-01T10:00:00Z.")]
    InvalidTime(String),

    #[error("Event title must not be empty")]
    EmptyTitle,

    #[error("Event not found.")]
    EventNotFound,

    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),
}

/// Errors produced while resolving or running a tool call.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArgument { tool: String, message: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("The server closed the connection ({code}): {reason}")]
    RemoteClosed { code: u16, reason: String },

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("Invalid client message: {0}")]
    InvalidClientMessage(String),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl Error {
    /// Whether the error is confined to one message, leaving the connection usable.
    #[must_use]
    pub const fn is_message_scoped(&self) -> bool {
        matches!(self, Self::InvalidClientMessage(_) | Self::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
