//! Error types for the consent engine

use thiserror::Error;

/// Result type for consent engine operations
pub type Result<T> = std::result::Result<T, ConsentEngineError>;

/// Consent engine errors
#[derive(Error, Debug)]
pub enum ConsentEngineError {
    /// Relational store error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Credential cache backend error
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Outbound HTTP transport error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bank code does not resolve to a configured bank
    #[error("Unknown bank code: {0}")]
    UnknownBank(String),

    /// Bank credential could not be obtained
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Bank answered with a non-success status
    #[error("Bank {bank} rejected request with status {status}: {body}")]
    BankRejected {
        bank: String,
        status: u16,
        body: String,
    },

    /// User could not be resolved
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used to decide whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected immediately, never retried (unknown bank, bad input)
    Configuration,
    /// Upstream bank trouble; the record stays pending until the next tick
    Transient,
    /// Persistent store failure
    Store,
}

impl ConsentEngineError {
    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConsentEngineError::UnknownBank(_)
            | ConsentEngineError::UserNotFound(_)
            | ConsentEngineError::Validation(_)
            | ConsentEngineError::Config(_) => ErrorCategory::Configuration,
            ConsentEngineError::Http(_)
            | ConsentEngineError::Credential(_)
            | ConsentEngineError::BankRejected { .. }
            | ConsentEngineError::Serialization(_) => ErrorCategory::Transient,
            ConsentEngineError::Database(_)
            | ConsentEngineError::Cache(_)
            | ConsentEngineError::Internal(_) => ErrorCategory::Store,
        }
    }

    /// Whether the next reconciliation tick may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Configuration)
    }
}

impl From<config::ConfigError> for ConsentEngineError {
    fn from(err: config::ConfigError) -> Self {
        ConsentEngineError::Config(err.to_string())
    }
}

/// Bank credential issuance failure.
///
/// `Clone` so one in-flight issuance result can be handed to every caller
/// that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Token endpoint unreachable
    #[error("token request to {bank} failed: {reason}")]
    Transport { bank: String, reason: String },

    /// Token endpoint answered with a non-success status
    #[error("token request to {bank} returned status {status}: {body}")]
    Rejected {
        bank: String,
        status: u16,
        body: String,
    },

    /// Token endpoint answered without a usable token
    #[error("token response from {bank} is malformed: {reason}")]
    Malformed { bank: String, reason: String },
}
