//! Error taxonomy of the transaction core.
//!
//! Validation failures and gateway declines are business outcomes: the first
//! is returned before anything is written, the second is an approved-or-not
//! record in an `Ok` response. Transport, circuit and cancellation failures
//! are the exceptional paths and always leave the pending record resumable.

use thiserror::Error;
use uuid::Uuid;

use crate::adapters::GatewayError;
use crate::core::gateway_client::CallError;
use crate::core::ledger_store::StoreError;
use crate::domain::TransactionType;

/// An operation is illegal given the group's derived state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Merchant id must not be empty")]
    MissingMerchant,

    #[error("Idempotency key must not be empty")]
    MissingKey,

    #[error("Transaction group not found: {0}")]
    NotFound(Uuid),

    #[error("Transaction group {0} has no approved root")]
    RootNotApproved(Uuid),

    #[error("{operation} is not supported on a {root} group")]
    UnsupportedOperation {
        operation: TransactionType,
        root: TransactionType,
    },

    #[error("Transaction group {0} has been voided")]
    Voided(Uuid),

    #[error("Capture of {requested} exceeds remaining authorization of {remaining}")]
    CaptureExceedsAuthorization { requested: i64, remaining: i64 },

    #[error("Multiple captures are disabled; group already has a capture")]
    MultiCaptureDisabled,

    #[error("Refund of {requested} exceeds refundable amount of {remaining}")]
    RefundExceedsCaptured { requested: i64, remaining: i64 },

    #[error("Nothing in transaction group {0} can be voided")]
    NotVoidable(Uuid),

    /// Another operation on the group is still pending at the gateway
    #[error("Transaction group {0} has a pending operation; retry once it settles")]
    OperationInFlight(Uuid),

    #[error("Idempotency key '{0}' was already used with different parameters")]
    KeyReuse(String),
}

/// Failure of an orchestrated operation
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Retries exhausted or the gateway refused the request
    #[error("Gateway call failed after {attempts} attempt(s): {source}")]
    Gateway {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("Circuit breaker is open for gateway '{0}'")]
    CircuitOpen(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Ledger storage failure: {0}")]
    Store(#[from] StoreError),
}

impl TransactionError {
    /// Whether retrying with the same idempotency key may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::Validation(ValidationError::OperationInFlight(_)) => true,
            TransactionError::Validation(_) => false,
            TransactionError::Gateway { source, .. } => source.is_retriable(),
            TransactionError::CircuitOpen(_)
            | TransactionError::Cancelled
            | TransactionError::DeadlineExceeded
            | TransactionError::Store(_) => true,
        }
    }
}

impl From<CallError> for TransactionError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::CircuitOpen { gateway } => TransactionError::CircuitOpen(gateway),
            CallError::Failed { attempts, source } => TransactionError::Gateway { attempts, source },
            CallError::Cancelled => TransactionError::Cancelled,
            CallError::DeadlineExceeded => TransactionError::DeadlineExceeded,
        }
    }
}
