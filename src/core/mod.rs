//! Core transaction machinery.
//!
//! This module contains:
//! - LedgerStore: Append-only SQLite ledger with pending-record leases
//! - IdempotencyResolver: At-most-once resolution of idempotency keys
//! - CircuitBreaker: Shared fault detection for the gateway
//! - RetryExecutor: Cancellable, backoff-bounded retries
//! - GatewayClient: Breaker + retry around the gateway collaborator
//! - TransactionOrchestrator: Main execution engine

pub mod breaker;
pub mod gateway_client;
pub mod idempotency;
pub mod ledger_store;
pub mod orchestrator;
pub mod retry;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerMonitor, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use gateway_client::{CallError, GatewayClient};
pub use idempotency::{IdempotencyConfig, IdempotencyResolver, Resolution};
pub use ledger_store::{Lease, LedgerStore, StoreError, StoredRecord};
pub use orchestrator::{
    BusinessRules, CallContext, FollowUpRequest, PaymentMethodRequest, PaymentRequest,
    TransactionOrchestrator, TransactionResponse, VoidRequest,
};
pub use retry::{Retriable, RetryError, RetryExecutor, RetryPolicy};
