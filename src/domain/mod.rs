//! Domain types for the payment ledger.
//!
//! This module contains the core data structures:
//! - TransactionRecord: Immutable rows of the append-only ledger
//! - GroupState: Settlement state derived by replaying a group
//! - ReferenceMapper: Deterministic numeric gateway references

pub mod group_state;
pub mod record;
pub mod reference;

// Re-export commonly used types
pub use group_state::{CaptureEntry, GroupState, VoidTarget};
pub use record::{NewRecord, RecordStatus, Settlement, TransactionRecord, TransactionType};
pub use reference::{fnv1a_64, request_fingerprint, ReferenceMapper};
