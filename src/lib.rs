//! payledger - Append-only payment ledger with an idempotent gateway client
//!
//! The transactional core of a payment backend: it brokers authorize,
//! capture, sale, void and refund operations against an external processing
//! gateway on behalf of many merchants.
//!
//! # Architecture
//!
//! The system is built around an append-only ledger:
//! - Every operation is a new immutable record; nothing is edited in place
//! - The settlement state of a group is derived by replaying its records
//! - An idempotency key maps to at most one gateway effect, even across
//!   concurrent duplicates, retries and crashes
//! - Gateway calls run behind a shared circuit breaker and cancellable retries
//!
//! # Modules
//!
//! - `adapters`: Gateway collaborator contract and the HTTP gateway
//! - `core`: Ledger store, idempotency, breaker, retry, orchestrator
//! - `domain`: Records, derived group state, numeric references
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Authorize, then capture part of it
//! payledger authorize --merchant m-1 --token pm-123 10000 --key order-17-auth
//! payledger capture <group-id> 6000 --key order-17-cap-1
//!
//! # Inspect the group
//! payledger state <group-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use adapters::{Gateway, GatewayError, GatewayRequest, GatewayResponse, HttpGateway};
pub use core::{
    CallContext, FollowUpRequest, PaymentMethodRequest, PaymentRequest, TransactionOrchestrator,
    TransactionResponse, VoidRequest,
};
pub use domain::{GroupState, RecordStatus, TransactionRecord, TransactionType};
pub use error::{TransactionError, ValidationError};
