//! Deterministic numeric gateway references and request fingerprints.
//!
//! The gateway only accepts short, purely numeric transaction references. The
//! mapper folds a record id through 64-bit FNV-1a and keeps the low decimal
//! digits, so the same id always yields the same reference and a resumed
//! attempt reuses the reference of the interrupted one.
//!
//! # Collisions
//!
//! Distinct ids can map to the same reference. The gateway scopes references
//! by merchant and time window rather than globally, so a collision only
//! matters between two records of one merchant inside that window. The ledger
//! checks for exactly that case before inserting a record and, when it finds
//! one, moves to a salted variant (see [`ReferenceMapper::salted`]). Collisions
//! across merchants or outside the window are accepted.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::record::TransactionType;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Widest reference that still fits a signed 64-bit column
pub const MAX_REFERENCE_DIGITS: u32 = 18;

/// Default reference width
pub const DEFAULT_REFERENCE_DIGITS: u32 = 12;

/// 64-bit FNV-1a
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Maps record ids to gateway references of a fixed decimal width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceMapper {
    digits: u32,
    modulus: u64,
}

impl Default for ReferenceMapper {
    fn default() -> Self {
        Self::new(DEFAULT_REFERENCE_DIGITS)
    }
}

impl ReferenceMapper {
    /// Create a mapper producing at most `digits` decimal digits (clamped to 1..=18)
    pub fn new(digits: u32) -> Self {
        let digits = digits.clamp(1, MAX_REFERENCE_DIGITS);
        Self {
            digits,
            modulus: 10u64.pow(digits),
        }
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    /// Reference for an id
    pub fn reference_for(&self, id: &Uuid) -> u64 {
        fnv1a_64(id.as_bytes()) % self.modulus
    }

    /// Alternative reference for an id, used after a detected collision.
    /// Salt 0 is the plain reference.
    pub fn salted(&self, id: &Uuid, salt: u32) -> u64 {
        if salt == 0 {
            return self.reference_for(id);
        }
        let mut bytes = id.as_bytes().to_vec();
        bytes.extend_from_slice(&salt.to_be_bytes());
        fnv1a_64(&bytes) % self.modulus
    }

    /// Zero-padded decimal form sent over the wire
    pub fn format(&self, reference: u64) -> String {
        format!("{:0width$}", reference, width = self.digits as usize)
    }
}

/// Fingerprint of the parameters an idempotency key was first used with
/// (first 16 hex chars of SHA-256)
pub fn request_fingerprint(
    txn_type: TransactionType,
    merchant_id: &str,
    group_id: Option<Uuid>,
    amount: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(txn_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(merchant_id.as_bytes());
    hasher.update(b"|");
    if let Some(group_id) = group_id {
        hasher.update(group_id.as_bytes());
    }
    hasher.update(b"|");
    hasher.update(amount.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
