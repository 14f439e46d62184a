//! Error types for the dispatcher-core library

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatcherError {
    /// A destination row, URI or host could not be used. Reload skips the row.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Building the next generation ran out of resources. The previous one keeps serving.
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Destination set {0} not found")]
    SetNotFound(u32),

    #[error("Destination {address} not found in set {group}")]
    DestinationNotFound { group: u32, address: String },

    #[error("Reload already in progress")]
    ReloadInProgress,

    #[error("No destination sets loaded")]
    NoDestinations,

    #[error("No usable destination in set {0}")]
    SelectionExhausted(u32),

    #[error("Destination already set to {0}")]
    DestinationAlreadySet(String),

    #[error("No call-load entry for call {0}")]
    TrackerMiss(String),

    #[error("Failover support disabled")]
    FailoverDisabled,

    #[error("No more failover destinations")]
    FailoverExhausted,

    #[error("Missing hash key: {0}")]
    MissingKey(String),

    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Message update failed: {0}")]
    Message(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatcherError {
    /// Errors the caller may retry later without changing its input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DispatcherError::ReloadInProgress
                | DispatcherError::SelectionExhausted(_)
                | DispatcherError::FailoverExhausted
        )
    }

    /// Errors that only affect a single destination row during a reload.
    pub fn is_row_error(&self) -> bool {
        matches!(
            self,
            DispatcherError::Config(_) | DispatcherError::InvalidUri { .. }
        )
    }

    pub(crate) fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        DispatcherError::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatcherError>;
