//! Pipeline error taxonomy.
//!
//! Every stage failure is classified into one of a closed set of kinds.
//! The kind decides whether the task runtime retries, how the retry delay
//! is computed, and whether the document is marked failed outright.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified error categories that drive retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network blip, 5xx from a provider, short timeout.
    Transient,
    /// OOM, disk full, worker memory ceiling breach.
    Resource,
    /// 429 or an empty token bucket.
    RateLimit,
    /// Missing credentials, invalid bucket. Needs manual intervention.
    Configuration,
    /// Unreadable PDF, corrupt bytes, empty OCR output.
    Data,
    /// Provider rejected the resource or a stage produced invalid output.
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::RateLimit => "rate_limit",
            Self::Configuration => "configuration",
            Self::Data => "data",
            Self::Permanent => "permanent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "resource" => Some(Self::Resource),
            "rate_limit" => Some(Self::RateLimit),
            "configuration" => Some(Self::Configuration),
            "data" => Some(Self::Data),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }

    /// Whether the runtime may schedule another attempt for this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Resource | Self::RateLimit)
    }

    /// Base retry delay before jitter, given the attempt number (0-based).
    ///
    /// Transient and rate-limit errors back off exponentially; resource
    /// errors back off linearly so a loaded host gets steady breathing room.
    /// Non-retryable kinds return `None`.
    pub fn retry_delay(&self, retry_count: u32) -> Option<Duration> {
        match self {
            Self::Transient => {
                Some(Duration::from_secs(2u64.saturating_pow(retry_count).min(300)))
            }
            Self::RateLimit => {
                Some(Duration::from_secs((5u64 * 2u64.saturating_pow(retry_count)).min(600)))
            }
            Self::Resource => Some(Duration::from_secs(30 * (retry_count as u64 + 1))),
            Self::Configuration | Self::Data | Self::Permanent => None,
        }
    }
}

/// A classified stage failure.
///
/// Stages return `Result<_, StageError>`; the runtime interprets the kind
/// uniformly and never inspects the message.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {message}", kind.as_str())]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<diesel::result::Error> for StageError {
    fn from(e: diesel::result::Error) -> Self {
        // Constraint violations mean a stage emitted invalid output; anything
        // else from SQLite is treated as recoverable.
        match &e {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation
                | diesel::result::DatabaseErrorKind::ForeignKeyViolation
                | diesel::result::DatabaseErrorKind::CheckViolation
                | diesel::result::DatabaseErrorKind::NotNullViolation,
                _,
            ) => Self::permanent(format!("schema violation: {}", e)),
            _ => Self::transient(format!("database error: {}", e)),
        }
    }
}

impl From<redis::RedisError> for StageError {
    fn from(e: redis::RedisError) -> Self {
        Self::transient(format!("state store error: {}", e))
    }
}
