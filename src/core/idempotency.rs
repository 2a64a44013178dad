//! Idempotency resolution over the ledger.
//!
//! An idempotency key maps to at most one ledger record and therefore at
//! most one gateway effect:
//!
//! - terminal record: returned unchanged, no side effects
//! - pending record with a live lease: another attempt is calling the
//!   gateway, so wait (polling the durable row) until it settles
//! - pending record whose lease lapsed or was released: claim it and resume
//!   with the stored numeric reference
//! - no record: insert a pending one; losing the UNIQUE race defers to the
//!   winner instead of failing

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{NewRecord, TransactionRecord};
use crate::error::{TransactionError, ValidationError};

use super::ledger_store::{Lease, LedgerStore, StoreError};

/// Lease and polling tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long an attempt may hold a pending record before others may resume it
    #[serde(with = "seconds", rename = "lease_seconds", default = "default_lease")]
    pub lease_ttl: Duration,

    /// How often a waiting duplicate re-reads the pending record
    #[serde(with = "millis", rename = "poll_interval_ms", default = "default_poll")]
    pub poll_interval: Duration,
}

fn default_lease() -> Duration {
    Duration::from_secs(120)
}
fn default_poll() -> Duration {
    Duration::from_millis(50)
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            lease_ttl: default_lease(),
            poll_interval: default_poll(),
        }
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// What the caller holding an idempotency key must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The caller owns the pending record and must call the gateway
    Owned {
        record: TransactionRecord,
        lease: Lease,

        /// True if an earlier attempt created the record
        resumed: bool,
    },

    /// The key already has a terminal outcome
    Completed(TransactionRecord),
}

/// Resolves idempotency keys against the ledger
#[derive(Clone)]
pub struct IdempotencyResolver {
    store: LedgerStore,
    config: IdempotencyConfig,
}

impl IdempotencyResolver {
    pub fn new(store: LedgerStore, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> IdempotencyConfig {
        self.config
    }

    /// Resolve a key that may already be in the ledger.
    ///
    /// Returns `None` if the key has never been used. A key used with a
    /// different request fingerprint is a [`ValidationError::KeyReuse`].
    pub async fn resolve(
        &self,
        key: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Option<Resolution>, TransactionError> {
        loop {
            let Some(stored) = self.store.find_by_key(key).await? else {
                return Ok(None);
            };

            if stored.record.request_fingerprint != fingerprint {
                return Err(ValidationError::KeyReuse(key.to_string()).into());
            }

            if !stored.record.is_pending() {
                debug!(key, record_id = %stored.record.id, "Key already settled");
                return Ok(Some(Resolution::Completed(stored.record)));
            }

            let live = stored.lease.is_some_and(|lease| !lease.is_expired(Utc::now()));
            if !live {
                let lease = Lease::new(self.config.lease_ttl);
                if self.store.claim(stored.record.id, lease).await? {
                    info!(
                        key,
                        record_id = %stored.record.id,
                        reference = stored.record.gateway_reference,
                        "Resuming interrupted attempt"
                    );
                    return Ok(Some(Resolution::Owned {
                        record: stored.record,
                        lease,
                        resumed: true,
                    }));
                }
                // Lost the claim; re-read whatever the winner left
                continue;
            }

            debug!(key, record_id = %stored.record.id, "Waiting for in-flight attempt");
            self.pause(cancel, deadline).await?;
        }
    }

    /// Insert a fresh pending record, deferring to the winner on a lost race
    pub async fn begin(
        &self,
        new: NewRecord,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Resolution, TransactionError> {
        let key = new.idempotency_key.clone();
        let fingerprint = new.request_fingerprint.clone();
        let lease = Lease::new(self.config.lease_ttl);

        let inserted = self.store.insert_pending(new, lease).await;
        self.owned_or_defer(inserted, lease, &key, &fingerprint, cancel, deadline)
            .await
    }

    /// Insert a pending record into an existing group.
    ///
    /// `build` validates the operation against the group's records and
    /// produces the record to insert, atomically with the insert itself, so
    /// concurrent operations on one group under different keys each see the
    /// others' pending records.
    pub async fn begin_in_group<F>(
        &self,
        group_id: Uuid,
        key: &str,
        fingerprint: &str,
        build: F,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Resolution, TransactionError>
    where
        F: FnOnce(&[TransactionRecord]) -> Result<NewRecord, ValidationError> + Send + 'static,
    {
        let lease = Lease::new(self.config.lease_ttl);

        let inserted = match self.store.insert_pending_in_group(group_id, lease, build).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(rejected)) => return Err(rejected.into()),
            Err(e) => Err(e),
        };
        self.owned_or_defer(inserted, lease, key, fingerprint, cancel, deadline)
            .await
    }

    async fn owned_or_defer(
        &self,
        inserted: Result<TransactionRecord, StoreError>,
        lease: Lease,
        key: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Resolution, TransactionError> {
        match inserted {
            Ok(record) => {
                debug!(key, record_id = %record.id, "Inserted pending record");
                Ok(Resolution::Owned {
                    record,
                    lease,
                    resumed: false,
                })
            }
            Err(StoreError::DuplicateKey(_)) => {
                debug!(key, "Lost insert race, deferring to existing record");
                self.resolve(key, fingerprint, cancel, deadline)
                    .await?
                    .ok_or_else(|| StoreError::DuplicateKey(key.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give up ownership so the next retry with the key resumes immediately
    pub async fn release(&self, record: &TransactionRecord, lease: &Lease) -> Result<(), StoreError> {
        self.store.release(record.id, lease.owner).await
    }

    async fn pause(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), TransactionError> {
        let mut wake = Instant::now() + self.config.poll_interval;
        if let Some(deadline) = deadline {
            if deadline <= Instant::now() {
                return Err(TransactionError::DeadlineExceeded);
            }
            wake = wake.min(deadline);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransactionError::Cancelled),
            _ = tokio::time::sleep_until(wake) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordStatus, Settlement, TransactionType};

    fn resolver() -> (LedgerStore, IdempotencyResolver) {
        let store = LedgerStore::open_in_memory().unwrap();
        let resolver = IdempotencyResolver::new(
            store.clone(),
            IdempotencyConfig {
                lease_ttl: Duration::from_secs(60),
                poll_interval: Duration::from_millis(5),
            },
        );
        (store, resolver)
    }

    fn approved() -> Settlement {
        Settlement {
            status: RecordStatus::Approved,
            response_code: "00".to_string(),
            response_message: "Approved".to_string(),
            external_token: Some("tok".to_string()),
            settled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unknown_key_resolves_to_none() {
        let (_store, resolver) = resolver();
        let result = resolver
            .resolve("nope", "fp", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_begin_then_replay() {
        let (store, resolver) = resolver();
        let cancel = CancellationToken::new();
        let new = NewRecord::root("m-1", TransactionType::Sale, 500, "k-1");
        let fingerprint = new.request_fingerprint.clone();

        let Resolution::Owned { record, lease, resumed } =
            resolver.begin(new, &cancel, None).await.unwrap()
        else {
            panic!("fresh key should be owned");
        };
        assert!(!resumed);
        store.settle(record.id, lease.owner, approved()).await.unwrap();

        let replay = resolver
            .resolve("k-1", &fingerprint, &cancel, None)
            .await
            .unwrap();
        match replay {
            Some(Resolution::Completed(settled)) => {
                assert_eq!(settled.id, record.id);
                assert_eq!(settled.status, RecordStatus::Approved);
            }
            other => panic!("expected completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_key_reuse_with_other_parameters() {
        let (_store, resolver) = resolver();
        let cancel = CancellationToken::new();
        resolver
            .begin(NewRecord::root("m-1", TransactionType::Sale, 500, "k-1"), &cancel, None)
            .await
            .unwrap();

        let other = NewRecord::root("m-1", TransactionType::Sale, 700, "k-1");
        let err = resolver
            .resolve("k-1", &other.request_fingerprint, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Validation(ValidationError::KeyReuse(ref key)) if key == "k-1"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_begin_defers_to_winner() {
        let (store, resolver) = resolver();
        let cancel = CancellationToken::new();
        let first = NewRecord::root("m-1", TransactionType::Auth, 100, "k-1");
        let Resolution::Owned { record, lease, .. } =
            resolver.begin(first, &cancel, None).await.unwrap()
        else {
            panic!("fresh key should be owned");
        };
        store.settle(record.id, lease.owner, approved()).await.unwrap();

        let second = NewRecord::root("m-1", TransactionType::Auth, 100, "k-1");
        let resolution = resolver.begin(second, &cancel, None).await.unwrap();
        assert!(matches!(resolution, Resolution::Completed(ref r) if r.id == record.id));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_live_lease() {
        let (store, resolver) = resolver();
        let cancel = CancellationToken::new();
        let new = NewRecord::root("m-1", TransactionType::Sale, 500, "k-1");
        let fingerprint = new.request_fingerprint.clone();
        let Resolution::Owned { record, lease, .. } =
            resolver.begin(new, &cancel, None).await.unwrap()
        else {
            panic!("fresh key should be owned");
        };

        let settler = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.settle(record.id, lease.owner, approved()).await.unwrap();
            })
        };

        let resolution = resolver
            .resolve("k-1", &fingerprint, &cancel, None)
            .await
            .unwrap();
        assert!(matches!(resolution, Some(Resolution::Completed(ref r)) if r.is_approved()));
        settler.await.unwrap();
    }

    #[tokio::test]
    async fn test_claims_lapsed_lease() {
        let (store, resolver) = resolver();
        let new = NewRecord::root("m-1", TransactionType::Auth, 100, "k-1");
        let fingerprint = new.request_fingerprint.clone();
        let stale = Lease::new(Duration::ZERO);
        let original = store.insert_pending(new, stale).await.unwrap();

        let resolution = resolver
            .resolve("k-1", &fingerprint, &CancellationToken::new(), None)
            .await
            .unwrap();
        match resolution {
            Some(Resolution::Owned { record, lease, resumed }) => {
                assert!(resumed);
                assert_eq!(record.gateway_reference, original.gateway_reference);
                assert_ne!(lease.owner, stale.owner);
            }
            other => panic!("expected owned, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let (_store, resolver) = resolver();
        let cancel = CancellationToken::new();
        let new = NewRecord::root("m-1", TransactionType::Sale, 500, "k-1");
        let fingerprint = new.request_fingerprint.clone();
        resolver.begin(new, &cancel, None).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = resolver
            .resolve("k-1", &fingerprint, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_honours_deadline() {
        let (_store, resolver) = resolver();
        let cancel = CancellationToken::new();
        let new = NewRecord::root("m-1", TransactionType::Sale, 500, "k-1");
        let fingerprint = new.request_fingerprint.clone();
        resolver.begin(new, &cancel, None).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(30);
        let err = resolver
            .resolve("k-1", &fingerprint, &cancel, Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_group_begin_rejection_writes_nothing() {
        let (store, resolver) = resolver();
        let cancel = CancellationToken::new();
        let root = NewRecord::root("m-1", TransactionType::Auth, 500, "auth");
        let group = root.id;
        resolver.begin(root, &cancel, None).await.unwrap();

        let err = resolver
            .begin_in_group(
                group,
                "cap",
                "fp",
                move |_records: &[TransactionRecord]| Err(ValidationError::Voided(group)),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Validation(ValidationError::Voided(id)) if id == group
        ));
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.find_by_key("cap").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_begin_defers_to_existing_key() {
        let (_store, resolver) = resolver();
        let cancel = CancellationToken::new();
        let root = NewRecord::root("m-1", TransactionType::Auth, 500, "auth");
        let group = root.id;
        resolver.begin(root, &cancel, None).await.unwrap();

        let capture = NewRecord::child(group, group, "m-1", TransactionType::Capture, 100, "cap");
        let fingerprint = capture.request_fingerprint.clone();
        let first = capture.clone();
        resolver
            .begin_in_group(group, "cap", &fingerprint, move |_| Ok(first), &cancel, None)
            .await
            .unwrap();

        // Same key again: the live lease makes the second caller wait
        let deadline = Instant::now() + Duration::from_millis(30);
        let err = resolver
            .begin_in_group(
                group,
                "cap",
                &fingerprint,
                move |_| Ok(NewRecord { id: Uuid::new_v4(), ..capture }),
                &cancel,
                Some(deadline),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::DeadlineExceeded));
    }
}
