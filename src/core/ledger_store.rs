//! Append-only transaction ledger persisted in SQLite.
//!
//! One table, one row per transaction record. The idempotency key column is
//! UNIQUE, which makes the database the only arbiter between concurrent
//! callers using the same key, across every process sharing the file.
//! Triggers reject DELETEs and any UPDATE of a settled row, so a record leaves
//! the pending state exactly once and is never touched again. There is no
//! table of derived state.
//!
//! While pending, a record carries a lease naming the attempt allowed to call
//! the gateway for it. Leases are the only mutable columns of a pending row.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{NewRecord, RecordStatus, ReferenceMapper, Settlement, TransactionRecord};

/// How many salted references to try before giving up on collision avoidance
const MAX_REFERENCE_SALTS: u32 = 8;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    id                  BLOB NOT NULL UNIQUE,
    group_id            BLOB NOT NULL,
    parent_id           BLOB,
    merchant_id         TEXT NOT NULL,
    txn_type            TEXT NOT NULL,
    amount              INTEGER NOT NULL,
    status              TEXT NOT NULL DEFAULT 'pending',
    response_code       TEXT,
    response_message    TEXT,
    idempotency_key     TEXT NOT NULL UNIQUE,
    request_fingerprint TEXT NOT NULL,
    gateway_reference   INTEGER NOT NULL,
    external_token      TEXT,
    created_at          TEXT NOT NULL,
    settled_at          TEXT,
    lease_owner         BLOB,
    lease_expires_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_transactions_group
    ON transactions (group_id, created_at, seq);

CREATE INDEX IF NOT EXISTS idx_transactions_reference
    ON transactions (merchant_id, gateway_reference, created_at);

CREATE INDEX IF NOT EXISTS idx_transactions_pending
    ON transactions (created_at) WHERE status = 'pending';

CREATE TRIGGER IF NOT EXISTS transactions_settled_immutable
BEFORE UPDATE ON transactions
WHEN OLD.status <> 'pending'
BEGIN
    SELECT RAISE(ABORT, 'settled transaction records are immutable');
END;

CREATE TRIGGER IF NOT EXISTS transactions_append_only
BEFORE DELETE ON transactions
BEGIN
    SELECT RAISE(ABORT, 'transaction records are append-only');
END;
"#;

const COLUMNS: &str = "id, group_id, parent_id, merchant_id, txn_type, amount, status, \
     response_code, response_message, idempotency_key, request_fingerprint, \
     gateway_reference, external_token, created_at, settled_at, lease_owner, lease_expires_at";

/// Errors raised by the ledger store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Another caller inserted a record with this key first
    #[error("Duplicate idempotency key: {0}")]
    DuplicateKey(String),

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// The attempt no longer owns the pending record
    #[error("Lease on record {0} is held by another attempt")]
    LeaseLost(Uuid),

    #[error("Ledger file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Amount or reference out of range: {0}")]
    OutOfRange(String),

    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Ledger connection lock poisoned")]
    Poisoned,
}

/// Right of one attempt to call the gateway for a pending record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A fresh lease for a new attempt
    pub fn new(ttl: Duration) -> Self {
        Self {
            owner: Uuid::new_v4(),
            expires_at: Utc::now() + to_chrono(ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A record together with its lease (only ever set while pending)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub record: TransactionRecord,
    pub lease: Option<Lease>,
}

/// SQLite-backed transaction ledger
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,

    /// Database file (None for in-memory ledgers)
    path: Option<PathBuf>,

    mapper: ReferenceMapper,

    /// Window inside which two records of one merchant must not share a reference
    collision_window: chrono::Duration,
}

impl LedgerStore {
    /// Open (or create) a ledger database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db_path = path.clone();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(&db_path)?;
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            Self::init(&conn)?;
            Ok(conn)
        })
        .await??;

        debug!(path = %path.display(), "Opened ledger");

        Ok(Self::from_connection(conn, Some(path)))
    }

    /// Open a private in-memory ledger
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            mapper: ReferenceMapper::default(),
            collision_window: chrono::Duration::hours(24),
        }
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Use a specific reference mapper and collision window
    pub fn with_references(mut self, mapper: ReferenceMapper, collision_window: Duration) -> Self {
        self.mapper = mapper;
        self.collision_window = to_chrono(collision_window);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn mapper(&self) -> ReferenceMapper {
        self.mapper
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    /// Insert a pending record owned by `lease`.
    ///
    /// Picks the record's numeric reference, stepping to a salted variant if
    /// the merchant already used the plain one inside the collision window.
    /// Fails with [`StoreError::DuplicateKey`] if the idempotency key exists.
    pub async fn insert_pending(
        &self,
        new: NewRecord,
        lease: Lease,
    ) -> Result<TransactionRecord, StoreError> {
        let mapper = self.mapper;
        let window = self.collision_window;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let record = insert_in(&tx, mapper, window, new, lease)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    /// Insert a pending record derived from the current records of a group.
    ///
    /// `build` sees every record of `group_id`, pending ones included, inside
    /// the same write transaction as the insert. No other writer, in this
    /// process or another one sharing the file, can add to the group between
    /// the check and the insert. If `build` rejects, nothing is written and its
    /// error is returned in the inner `Result`.
    pub async fn insert_pending_in_group<F, E>(
        &self,
        group_id: Uuid,
        lease: Lease,
        build: F,
    ) -> Result<Result<TransactionRecord, E>, StoreError>
    where
        F: FnOnce(&[TransactionRecord]) -> Result<NewRecord, E> + Send + 'static,
        E: Send + 'static,
    {
        let mapper = self.mapper;
        let window = self.collision_window;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let records = query_group(&tx, group_id)?;
            let new = match build(&records) {
                Ok(new) => new,
                Err(rejected) => return Ok(Err(rejected)),
            };
            let record = insert_in(&tx, mapper, window, new, lease)?;
            tx.commit()?;
            Ok(Ok(record))
        })
        .await
    }

    /// Look up a record by id
    pub async fn find(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM transactions WHERE id = ?1", COLUMNS);
            let stored = conn
                .query_row(&sql, params![id], read_stored)
                .optional()?;
            Ok(stored)
        })
        .await
    }

    /// Look up a record by idempotency key
    pub async fn find_by_key(&self, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM transactions WHERE idempotency_key = ?1", COLUMNS);
            let stored = conn
                .query_row(&sql, params![key], read_stored)
                .optional()?;
            Ok(stored)
        })
        .await
    }

    /// All records of a group in creation order
    pub async fn load_group(&self, group_id: Uuid) -> Result<Vec<TransactionRecord>, StoreError> {
        self.with_conn(move |conn| query_group(conn, group_id)).await
    }

    /// Pending records created before `older_than`, oldest first
    pub async fn pending_records(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM transactions WHERE status = 'pending' AND created_at < ?1 \
                 ORDER BY created_at, seq",
                COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![ts(&older_than)], read_stored)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    /// Take over a pending record whose lease has lapsed (or was released).
    ///
    /// Returns false if the record is settled or another attempt holds a live
    /// lease; the conditional UPDATE lets exactly one claimant win.
    pub async fn claim(&self, id: Uuid, lease: Lease) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let now = ts(&Utc::now());
            let updated = conn.execute(
                "UPDATE transactions SET lease_owner = ?1, lease_expires_at = ?2 \
                 WHERE id = ?3 AND status = 'pending' \
                 AND (lease_expires_at IS NULL OR lease_expires_at <= ?4)",
                params![lease.owner, ts(&lease.expires_at), id, now],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Give up a lease so a retry with the same key can resume at once
    pub async fn release(&self, id: Uuid, owner: Uuid) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE transactions SET lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = ?1 AND status = 'pending' AND lease_owner = ?2",
                params![id, owner],
            )?;
            Ok(())
        })
        .await
    }

    /// Write the terminal outcome onto a pending record owned by `owner`
    pub async fn settle(
        &self,
        id: Uuid,
        owner: Uuid,
        settlement: Settlement,
    ) -> Result<TransactionRecord, StoreError> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE transactions SET status = ?1, response_code = ?2, response_message = ?3, \
                 external_token = ?4, settled_at = ?5, lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = ?6 AND status = 'pending' AND lease_owner = ?7",
                params![
                    settlement.status,
                    settlement.response_code,
                    settlement.response_message,
                    settlement.external_token,
                    ts(&settlement.settled_at),
                    id,
                    owner,
                ],
            )?;

            if updated == 0 {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM transactions WHERE id = ?1)",
                    params![id],
                    |row| row.get(0),
                )?;
                return Err(if exists {
                    StoreError::LeaseLost(id)
                } else {
                    StoreError::NotFound(id)
                });
            }

            let sql = format!("SELECT {} FROM transactions WHERE id = ?1", COLUMNS);
            let stored = conn.query_row(&sql, params![id], read_stored)?;
            Ok(stored.record)
        })
        .await
    }

    /// Number of records in the ledger
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
            u64::try_from(count).map_err(|_| StoreError::OutOfRange(count.to_string()))
        })
        .await
    }
}

fn query_group(conn: &Connection, group_id: Uuid) -> Result<Vec<TransactionRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE group_id = ?1 ORDER BY created_at, seq",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![group_id], read_stored)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.record);
    }
    Ok(records)
}

fn reference_in_use(
    conn: &Connection,
    merchant_id: &str,
    reference: u64,
    since: &str,
) -> Result<bool, StoreError> {
    let in_use = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM transactions \
         WHERE merchant_id = ?1 AND gateway_reference = ?2 AND created_at >= ?3)",
        params![merchant_id, reference_to_sql(reference)?, since],
        |row| row.get(0),
    )?;
    Ok(in_use)
}

/// Insert a pending row inside an open write transaction
fn insert_in(
    conn: &Connection,
    mapper: ReferenceMapper,
    window: chrono::Duration,
    new: NewRecord,
    lease: Lease,
) -> Result<TransactionRecord, StoreError> {
    let now = Utc::now();
    let since = ts(&(now - window));

    let mut reference = mapper.reference_for(&new.id);
    let mut salt = 0;
    while reference_in_use(conn, &new.merchant_id, reference, &since)? {
        if salt == MAX_REFERENCE_SALTS {
            warn!(
                merchant_id = %new.merchant_id,
                reference,
                "Every salted reference collides, keeping the last one"
            );
            break;
        }
        salt += 1;
        warn!(
            merchant_id = %new.merchant_id,
            reference,
            salt,
            "Gateway reference collision, trying salted reference"
        );
        reference = mapper.salted(&new.id, salt);
    }

    let inserted = conn.execute(
        "INSERT INTO transactions (id, group_id, parent_id, merchant_id, txn_type, amount, \
         status, idempotency_key, request_fingerprint, gateway_reference, created_at, \
         lease_owner, lease_expires_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            new.id,
            new.group_id,
            new.parent_id,
            new.merchant_id,
            new.txn_type,
            new.amount,
            RecordStatus::Pending,
            new.idempotency_key,
            new.request_fingerprint,
            reference_to_sql(reference)?,
            ts(&now),
            lease.owner,
            ts(&lease.expires_at),
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(e) if is_duplicate_key(&e) => {
            return Err(StoreError::DuplicateKey(new.idempotency_key));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(TransactionRecord {
        id: new.id,
        group_id: new.group_id,
        parent_id: new.parent_id,
        merchant_id: new.merchant_id,
        txn_type: new.txn_type,
        amount: new.amount,
        status: RecordStatus::Pending,
        response_code: None,
        response_message: None,
        idempotency_key: new.idempotency_key,
        request_fingerprint: new.request_fingerprint,
        gateway_reference: reference,
        external_token: None,
        created_at: parse_ts(&ts(&now)).unwrap_or(now),
        settled_at: None,
    })
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Fixed-width UTC timestamps so text comparison orders them correctly
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn reference_to_sql(reference: u64) -> Result<i64, StoreError> {
    i64::try_from(reference).map_err(|_| StoreError::OutOfRange(reference.to_string()))
}

fn is_duplicate_key(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            failure.code == ErrorCode::ConstraintViolation
                && message
                    .as_deref()
                    .is_some_and(|m| m.contains("idempotency_key"))
        }
        _ => false,
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(text) => parse_ts(&text)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("invalid timestamp '{}'", text))),
    }
}

fn read_stored(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let reference: i64 = row.get(11)?;
    let gateway_reference = u64::try_from(reference)
        .map_err(|_| conversion_error(11, format!("negative reference {}", reference)))?;
    let created_at = get_ts(row, 13)?
        .ok_or_else(|| conversion_error(13, "missing created_at".to_string()))?;

    let record = TransactionRecord {
        id: row.get(0)?,
        group_id: row.get(1)?,
        parent_id: row.get(2)?,
        merchant_id: row.get(3)?,
        txn_type: row.get(4)?,
        amount: row.get(5)?,
        status: row.get(6)?,
        response_code: row.get(7)?,
        response_message: row.get(8)?,
        idempotency_key: row.get(9)?,
        request_fingerprint: row.get(10)?,
        gateway_reference,
        external_token: row.get(12)?,
        created_at,
        settled_at: get_ts(row, 14)?,
    };

    let lease_owner: Option<Uuid> = row.get(15)?;
    let lease = match (lease_owner, get_ts(row, 16)?) {
        (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
        _ => None,
    };

    Ok(StoredRecord { record, lease })
}
