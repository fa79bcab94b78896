//! Error types for the execution engine
//!
//! One taxonomy shared by the ledger, the accountant, the admission API and
//! the matching worker, using thiserror.

use thiserror::Error;

/// Top-level engine error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Bad input shape. Rejected before any mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("Insufficient holdings of {instrument}: required {required}, held {held}")]
    InsufficientHoldings {
        instrument: String,
        required: u64,
        held: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// E.g. mutating an order that is no longer OPEN.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A version-conditioned ledger write lost a race. Callers re-read and retry.
    #[error("Write conflict on {entity}: expected version {expected}, found {found}")]
    Conflict {
        entity: String,
        expected: u64,
        found: u64,
    },

    /// Price store or ledger temporarily unavailable.
    #[error("Transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Market closed or maximum wait elapsed without a trigger.
    #[error("Execution timeout: {0}")]
    ExecutionTimeout(String),
}

impl EngineError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientInfra(_) | EngineError::Conflict { .. })
    }

    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::InsufficientHoldings { .. } => "INSUFFICIENT_HOLDINGS",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::Conflict { .. } => "CONFLICT",
            EngineError::TransientInfra(_) => "TRANSIENT_INFRA",
            EngineError::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
