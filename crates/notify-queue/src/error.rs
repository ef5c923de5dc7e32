//! Error types for queue operations.
//!
//! Store-level failures ([`StoreError`]) never leave the crate's public surface
//! directly: the receiver and sender translate them into [`QueueError::Transport`],
//! keeping the original cause reachable through [`std::error::Error::source`].

use crate::message::RowId;
use thiserror::Error;

/// Transport-facing error returned by the receiver, sender and transport facade
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: StoreError,
    },

    #[error("Message decoding failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Message serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Logic error: {message}")]
    Logic { message: String },
}

impl QueueError {
    /// Wrap a store failure into the transport error kind
    pub fn transport(source: StoreError) -> Self {
        Self::Transport {
            message: source.to_string(),
            source,
        }
    }

    /// Check if error is transient and the operation may succeed when repeated
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_retryable(),
            Self::Configuration(_) => false,
            Self::Decode(_) => false,
            Self::Serialization(_) => false,
            Self::Logic { .. } => false,
        }
    }
}

/// Errors raised by the queue store and its backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Retryable store failure: {message}")]
    Retryable { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Header encoding failed: {0}")]
    HeaderEncoding(#[from] serde_json::Error),

    /// Stored header column of a row is not a JSON object of strings
    #[error("Headers of row {id} are unreadable: {source}")]
    UnreadableHeaders {
        id: RowId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Whether the backing table is missing and auto-setup may recover
    pub fn is_table_missing(&self) -> bool {
        matches!(self, Self::TableNotFound { .. })
    }

    /// Whether the failure is a lock/serialization conflict worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Configuration resolution errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("The given notification queue DSN \"{dsn}\" is invalid: {message}")]
    InvalidDsn { dsn: String, message: String },

    #[error("Unsupported DSN scheme \"{scheme}\" (expected \"{expected}\")")]
    UnsupportedScheme { scheme: String, expected: String },

    #[error("Unknown option found{location}: [{keys}]. Allowed options are [{allowed}].")]
    UnknownOptions {
        location: &'static str,
        keys: String,
        allowed: String,
    },

    #[error("Invalid value for option {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Payload model \"{model}\" is configured but no schema is registered for it")]
    UnregisteredModel { model: String },
}

/// Errors raised while decoding a stored row into a notification
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Missing \"type\" header")]
    MissingType,

    #[error("Stored headers are not valid JSON: {source}")]
    Headers {
        #[source]
        source: serde_json::Error,
    },

    #[error("No payload schema registered for type \"{model}\"")]
    UnknownModel { model: String },

    #[error("Payload does not match model \"{model}\": {source}")]
    Payload {
        model: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while encoding a notification for storage
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
