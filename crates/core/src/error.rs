use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of every failure the gateway can surface. Handlers map a
/// kind to an HTTP status; the string form is the wire-visible error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationFailed,
    InvalidJson,
    InvalidPhoneNumber,
    InvalidInput,
    MissingApiKey,
    InvalidApiKey,
    RevokedApiKey,
    Forbidden,
    NotFound,
    AlreadyExists,
    AlreadyInProgress,
    RateLimitExceeded,
    QueueFull,
    Disconnected,
    ConnectionFailed,
    ClientUnavailable,
    QrGenerationFailed,
    MessageSendFailed,
    MediaUploadFailed,
    EmptyContent,
    Database,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::InvalidJson => "INVALID_JSON",
            ErrorKind::InvalidPhoneNumber => "INVALID_PHONE_NUMBER",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::MissingApiKey => "MISSING_API_KEY",
            ErrorKind::InvalidApiKey => "INVALID_API_KEY",
            ErrorKind::RevokedApiKey => "REVOKED_API_KEY",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::Disconnected => "DISCONNECTED",
            ErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ErrorKind::ClientUnavailable => "CLIENT_UNAVAILABLE",
            ErrorKind::QrGenerationFailed => "QR_GENERATION_FAILED",
            ErrorKind::MessageSendFailed => "MESSAGE_SEND_FAILED",
            ErrorKind::MediaUploadFailed => "MEDIA_UPLOAD_FAILED",
            ErrorKind::EmptyContent => "EMPTY_CONTENT",
            ErrorKind::Database => "DATABASE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// HTTP status the kind surfaces as.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::ValidationFailed
            | ErrorKind::InvalidJson
            | ErrorKind::InvalidPhoneNumber
            | ErrorKind::InvalidInput
            | ErrorKind::Disconnected
            | ErrorKind::EmptyContent => 400,
            ErrorKind::MissingApiKey | ErrorKind::InvalidApiKey | ErrorKind::RevokedApiKey => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::AlreadyInProgress => 409,
            ErrorKind::RateLimitExceeded => 429,
            ErrorKind::MessageSendFailed
            | ErrorKind::MediaUploadFailed
            | ErrorKind::Database
            | ErrorKind::Internal => 500,
            ErrorKind::QueueFull
            | ErrorKind::ConnectionFailed
            | ErrorKind::ClientUnavailable
            | ErrorKind::QrGenerationFailed => 503,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain error: a kind from the taxonomy, a client-safe message, and an
/// optional cause chain that is logged but never surfaced verbatim.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{} not found: {}", entity, id))
    }

    pub fn already_exists(entity: &str, id: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyExists,
            format!("{} already exists: {}", entity, id),
        )
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}
