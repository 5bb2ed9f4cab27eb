use thiserror::Error;

/// Client-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    /// The backend answered with `success: false`
    #[error("Server rejected request [{code}]: {message}")]
    Rejected { code: String, message: String },

    #[error("Control lock required: {0}")]
    ControlRequired(String),

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Build a rejection from an optional server error code and message
    pub fn rejected(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.unwrap_or("server_error").to_string(),
            message: message.into(),
        }
    }

    /// Whether this error came from the transport rather than the server
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AppError::Internal(format!("Invalid server response: {}", err))
        } else {
            AppError::Network(err.to_string())
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
