//! Error types for the feedback loop
//!
//! Every failure names the precondition it violated. Nothing here is
//! downgraded to partial success by the callers.

use thiserror::Error;

/// Top-level error type for the ledger, learners and agents
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Insufficient data for {operation}: need {needed}, have {available}")]
    InsufficientData {
        operation: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Owner {owner} is busy: {operation} already in progress")]
    Busy { owner: String, operation: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LoopError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        LoopError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable kind, used by the RPC layer
    pub fn kind(&self) -> &'static str {
        match self {
            LoopError::NotFound { .. } => "not_found",
            LoopError::Conflict(_) => "conflict",
            LoopError::InvalidTransition { .. } => "invalid_transition",
            LoopError::InsufficientData { .. } => "insufficient_data",
            LoopError::Busy { .. } => "busy",
            LoopError::InvalidInput(_) => "invalid_input",
            LoopError::Storage(_) => "storage",
            LoopError::Serialization(_) => "serialization",
        }
    }

    /// JSON-RPC error code for this failure
    pub fn rpc_code(&self) -> i64 {
        match self {
            LoopError::NotFound { .. } => -32004,
            LoopError::Conflict(_) => -32009,
            LoopError::InvalidTransition { .. } => -32010,
            LoopError::InsufficientData { .. } => -32011,
            LoopError::Busy { .. } => -32012,
            LoopError::InvalidInput(_) => -32602,
            LoopError::Storage(_) | LoopError::Serialization(_) => -32000,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoopError>;
