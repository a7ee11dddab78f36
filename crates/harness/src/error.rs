//! Error types for the harness

use thiserror::Error;

/// Result type alias using the harness Error
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("Home Assistant exited during startup with code {}", .code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string()))]
    ProcessFailure { code: Option<i32> },

    #[error("Server reported an error: {0}")]
    Protocol(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Connection to Home Assistant closed")]
    Disconnected,

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("DOM error: {0}")]
    Dom(#[from] hasstest_dom::DomError),
}

impl Error {
    /// Transport failures worth another attempt while a server is still starting
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
