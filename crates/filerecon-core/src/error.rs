use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendFailure;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("No backends available ({} failed)", failures.len())]
    NoBackendsAvailable { failures: Vec<BackendFailure> },

    #[error("A sync run is already in progress")]
    SyncInProgress,
}

/// Failures raised by a storage backend adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("cannot connect to backend '{backend}': {reason}")]
    Connection { backend: String, reason: String },

    #[error("backend '{backend}' unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("'{path}' not found on backend '{backend}'")]
    NotFound { backend: String, path: String },

    #[error("backend '{backend}' timed out after {after:?}")]
    Timeout { backend: String, after: Duration },
}

impl BackendError {
    pub fn connection(backend: &str, reason: impl ToString) -> Self {
        BackendError::Connection {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn unavailable(backend: &str, reason: impl ToString) -> Self {
        BackendError::Unavailable {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(backend: &str, path: &str) -> Self {
        BackendError::NotFound {
            backend: backend.to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    /// The feature vector cannot be scored by the model.
    #[error("malformed feature vector: {0}")]
    InvalidInput(String),

    #[error("cannot load classifier artifact: {0}")]
    Artifact(String),
}
