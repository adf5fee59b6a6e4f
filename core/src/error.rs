//! Error types shared by models, slice reducers and persistence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of an asynchronous operation.
///
/// This is data, not a control-flow error: it is stored in the slice's
/// `error` bookkeeping for the failed key and handed to `on_fail` hooks.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct OperationError {
    /// Human readable description
    pub message: String,
    /// Optional machine readable code supplied by the transport
    pub code: Option<String>,
}

impl OperationError {
    /// Create an error with a message and no code
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attach a code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Placeholder used when a fail action carries no error value
    #[must_use]
    pub fn unspecified() -> Self {
        Self::new("operation failed")
    }
}

/// Errors reading a typed slice out of the root state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SliceError {
    /// No slice with this name is part of the root state
    #[error("Slice not registered: {0}")]
    NotRegistered(String),

    /// The model declared no data reducer
    #[error("Model {0} has no data slice; give it an initial state to read data")]
    NoData(String),

    /// The slice exists but holds a different data type
    #[error("Slice {0} holds a different data type than requested")]
    TypeMismatch(String),
}

/// Errors raised while reducing an action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    /// A transition produced different results for identical inputs.
    ///
    /// Only reported when purity verification is enabled.
    #[error("Transition for {operation} is not deterministic")]
    ImpureTransition {
        /// The action whose transition misbehaved
        operation: String,
    },
}

/// Errors from persistence storage backends and envelope encoding.
#[derive(Error, Debug)]
pub enum PersistError {
    /// The backend reported a failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Envelope or slice data could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage key cannot be used by this backend
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}
