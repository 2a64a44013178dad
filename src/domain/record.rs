//! Transaction records: the only persisted entity of the ledger.
//!
//! A record is inserted in the pending state before the gateway is called and
//! moves to a terminal state exactly once. Corrections are new records, never
//! edits, so the table doubles as the audit trail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of payment operation a record represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Hold placed on funds
    Auth,

    /// Conversion of a hold into a funds transfer
    Capture,

    /// Authorize and capture in one step
    Sale,

    /// Return of captured funds
    Refund,

    /// Cancellation of an AUTH, SALE or same-day CAPTURE
    Void,

    /// Payment method stored with the gateway, no funds move
    Storage,

    /// ACH pre-notification, no funds move
    PreNote,
}

impl TransactionType {
    pub const ALL: [TransactionType; 7] = [
        TransactionType::Auth,
        TransactionType::Capture,
        TransactionType::Sale,
        TransactionType::Refund,
        TransactionType::Void,
        TransactionType::Storage,
        TransactionType::PreNote,
    ];

    /// Root records start a group and never have a parent
    pub fn is_root(self) -> bool {
        matches!(
            self,
            TransactionType::Auth
                | TransactionType::Sale
                | TransactionType::Storage
                | TransactionType::PreNote
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Auth => "AUTH",
            TransactionType::Capture => "CAPTURE",
            TransactionType::Sale => "SALE",
            TransactionType::Refund => "REFUND",
            TransactionType::Void => "VOID",
            TransactionType::Storage => "STORAGE",
            TransactionType::PreNote => "PRE_NOTE",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown transaction type: {}", s))
    }
}

impl ToSql for TransactionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransactionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Settlement state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Inserted, gateway outcome not yet known
    Pending,

    /// Gateway approved the operation
    Approved,

    /// Gateway returned a well-formed business decline
    Declined,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Approved => "approved",
            RecordStatus::Declined => "declined",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for RecordStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RecordStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(RecordStatus::Pending),
            "approved" => Ok(RecordStatus::Approved),
            "declined" => Ok(RecordStatus::Declined),
            other => Err(FromSqlError::Other(
                format!("unknown record status: {}", other).into(),
            )),
        }
    }
}

/// One row of the append-only ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Caller-visible identifier
    pub id: Uuid,

    /// Id of the root record of the group (equal to `id` for roots)
    pub group_id: Uuid,

    /// Record this operation targets (None for roots)
    pub parent_id: Option<Uuid>,

    /// Merchant on whose behalf the operation runs
    pub merchant_id: String,

    pub txn_type: TransactionType,

    /// Amount in minor currency units
    pub amount: i64,

    pub status: RecordStatus,

    /// Gateway response code, None while pending
    pub response_code: Option<String>,

    /// Gateway response text, None while pending
    pub response_message: Option<String>,

    /// Caller-supplied idempotency key (unique across the ledger)
    pub idempotency_key: String,

    /// Hash of the parameters the key was first used with
    pub request_fingerprint: String,

    /// Numeric reference sent to the gateway
    pub gateway_reference: u64,

    /// Token returned by the gateway for use by dependent operations
    pub external_token: Option<String>,

    pub created_at: DateTime<Utc>,

    pub settled_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }

    pub fn is_approved(&self) -> bool {
        self.status == RecordStatus::Approved
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Parameters for inserting a pending record
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: Uuid,
    pub group_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub merchant_id: String,
    pub txn_type: TransactionType,
    pub amount: i64,
    pub idempotency_key: String,
    pub request_fingerprint: String,
}

impl NewRecord {
    /// A new root record; the group is identified by the record itself
    pub fn root(
        merchant_id: impl Into<String>,
        txn_type: TransactionType,
        amount: i64,
        idempotency_key: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let merchant_id = merchant_id.into();
        let request_fingerprint =
            super::reference::request_fingerprint(txn_type, &merchant_id, None, amount);
        Self {
            id,
            group_id: id,
            parent_id: None,
            merchant_id,
            txn_type,
            amount,
            idempotency_key: idempotency_key.into(),
            request_fingerprint,
        }
    }

    /// A new dependent record inside an existing group
    pub fn child(
        group_id: Uuid,
        parent_id: Uuid,
        merchant_id: impl Into<String>,
        txn_type: TransactionType,
        amount: i64,
        idempotency_key: impl Into<String>,
    ) -> Self {
        let merchant_id = merchant_id.into();
        let request_fingerprint = super::reference::request_fingerprint(
            txn_type,
            &merchant_id,
            Some(group_id),
            amount,
        );
        Self {
            id: Uuid::new_v4(),
            group_id,
            parent_id: Some(parent_id),
            merchant_id,
            txn_type,
            amount,
            idempotency_key: idempotency_key.into(),
            request_fingerprint,
        }
    }
}

/// Terminal outcome written onto a pending record exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Approved or Declined
    pub status: RecordStatus,
    pub response_code: String,
    pub response_message: String,
    pub external_token: Option<String>,
    pub settled_at: DateTime<Utc>,
}
