//! Transaction orchestrator.
//!
//! Every operation follows the same path: load the group and fold it into a
//! [`GroupState`], resolve the idempotency key, validate the operation against
//! the derived state, call the gateway through the breaker and retry layers,
//! and settle the pending record exactly once.
//!
//! A key that already has a terminal record is answered from the ledger
//! before validation runs, so retrying a completed request returns the
//! original outcome even if the group has moved on since.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{GatewayRequest, ResponseStatus};
use crate::domain::{
    request_fingerprint, GroupState, NewRecord, RecordStatus, Settlement, TransactionRecord,
    TransactionType, VoidTarget,
};
use crate::error::{TransactionError, ValidationError};

use super::breaker::BreakerSnapshot;
use super::gateway_client::GatewayClient;
use super::idempotency::{IdempotencyConfig, IdempotencyResolver, Resolution};
use super::ledger_store::{Lease, LedgerStore, StoreError, StoredRecord};

/// Business rules that depend on the gateway's capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessRules {
    /// Allow more than one CAPTURE against a single AUTH
    #[serde(default = "default_multi_capture")]
    pub multi_capture: bool,
}

fn default_multi_capture() -> bool {
    true
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            multi_capture: default_multi_capture(),
        }
    }
}

/// Cancellation and deadline for one operation
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Give up once `timeout` has elapsed from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// AUTH or SALE against a payment method
#[derive(Clone)]
pub struct PaymentRequest {
    pub merchant_id: String,

    /// Amount in minor currency units
    pub amount: i64,

    /// Opaque payment method token, never logged
    pub payment_token: String,

    pub idempotency_key: String,
}

impl fmt::Debug for PaymentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentRequest")
            .field("merchant_id", &self.merchant_id)
            .field("amount", &self.amount)
            .field("payment_token", &"<redacted>")
            .field("idempotency_key", &self.idempotency_key)
            .finish()
    }
}

/// STORAGE or PRE_NOTE of a payment method
#[derive(Clone)]
pub struct PaymentMethodRequest {
    pub merchant_id: String,
    pub payment_token: String,
    pub idempotency_key: String,
}

impl fmt::Debug for PaymentMethodRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentMethodRequest")
            .field("merchant_id", &self.merchant_id)
            .field("payment_token", &"<redacted>")
            .field("idempotency_key", &self.idempotency_key)
            .finish()
    }
}

/// CAPTURE or REFUND inside an existing group
#[derive(Debug, Clone)]
pub struct FollowUpRequest {
    /// Id of the group's root record
    pub group_id: Uuid,
    pub amount: i64,
    pub idempotency_key: String,
}

/// VOID inside an existing group; the target is chosen from the group state
#[derive(Debug, Clone)]
pub struct VoidRequest {
    pub group_id: Uuid,
    pub idempotency_key: String,
}

/// Outcome of an operation. Declines are responses too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionResponse {
    record: TransactionRecord,
    replayed: bool,
}

impl TransactionResponse {
    fn fresh(record: TransactionRecord) -> Self {
        Self {
            record,
            replayed: false,
        }
    }

    fn replay(record: TransactionRecord) -> Self {
        Self {
            record,
            replayed: true,
        }
    }

    pub fn record(&self) -> &TransactionRecord {
        &self.record
    }

    /// True if the outcome was read back from the ledger instead of produced
    /// by this call
    pub fn replayed(&self) -> bool {
        self.replayed
    }

    pub fn status(&self) -> RecordStatus {
        self.record.status
    }

    pub fn is_approved(&self) -> bool {
        self.record.is_approved()
    }

    pub fn into_record(self) -> TransactionRecord {
        self.record
    }
}

/// Coordinates ledger, idempotency and gateway for every operation type
pub struct TransactionOrchestrator {
    store: LedgerStore,
    resolver: IdempotencyResolver,
    client: GatewayClient,
    rules: BusinessRules,
}

impl TransactionOrchestrator {
    /// Create an orchestrator.
    ///
    /// The store should use the same reference mapper as the client.
    pub fn new(
        store: LedgerStore,
        client: GatewayClient,
        idempotency: IdempotencyConfig,
        rules: BusinessRules,
    ) -> Self {
        if store.mapper() != client.mapper() {
            warn!(
                store_digits = store.mapper().digits(),
                client_digits = client.mapper().digits(),
                "Ledger and gateway client use different reference widths"
            );
        }

        Self {
            resolver: IdempotencyResolver::new(store.clone(), idempotency),
            store,
            client,
            rules,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    pub fn rules(&self) -> BusinessRules {
        self.rules
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.client.breaker().snapshot()
    }

    /// Place a hold on funds
    #[instrument(
        skip(self, request, ctx),
        fields(merchant_id = %request.merchant_id, key = %request.idempotency_key, amount = request.amount)
    )]
    pub async fn authorize(
        &self,
        request: PaymentRequest,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        self.run_root(
            TransactionType::Auth,
            request.merchant_id,
            request.amount,
            request.payment_token,
            request.idempotency_key,
            ctx,
        )
        .await
    }

    /// Authorize and capture in one step
    #[instrument(
        skip(self, request, ctx),
        fields(merchant_id = %request.merchant_id, key = %request.idempotency_key, amount = request.amount)
    )]
    pub async fn sale(
        &self,
        request: PaymentRequest,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        self.run_root(
            TransactionType::Sale,
            request.merchant_id,
            request.amount,
            request.payment_token,
            request.idempotency_key,
            ctx,
        )
        .await
    }

    /// Store a payment method with the gateway (no funds move)
    #[instrument(
        skip(self, request, ctx),
        fields(merchant_id = %request.merchant_id, key = %request.idempotency_key)
    )]
    pub async fn store_payment_method(
        &self,
        request: PaymentMethodRequest,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        self.run_root(
            TransactionType::Storage,
            request.merchant_id,
            0,
            request.payment_token,
            request.idempotency_key,
            ctx,
        )
        .await
    }

    /// Zero-amount ACH pre-notification
    #[instrument(
        skip(self, request, ctx),
        fields(merchant_id = %request.merchant_id, key = %request.idempotency_key)
    )]
    pub async fn pre_note(
        &self,
        request: PaymentMethodRequest,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        self.run_root(
            TransactionType::PreNote,
            request.merchant_id,
            0,
            request.payment_token,
            request.idempotency_key,
            ctx,
        )
        .await
    }

    /// Capture part or all of an authorization
    #[instrument(
        skip(self, request, ctx),
        fields(group_id = %request.group_id, key = %request.idempotency_key, amount = request.amount)
    )]
    pub async fn capture(
        &self,
        request: FollowUpRequest,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        self.run_follow_up(
            TransactionType::Capture,
            request.group_id,
            Some(request.amount),
            request.idempotency_key,
            ctx,
        )
        .await
    }

    /// Return captured or sold funds
    #[instrument(
        skip(self, request, ctx),
        fields(group_id = %request.group_id, key = %request.idempotency_key, amount = request.amount)
    )]
    pub async fn refund(
        &self,
        request: FollowUpRequest,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        self.run_follow_up(
            TransactionType::Refund,
            request.group_id,
            Some(request.amount),
            request.idempotency_key,
            ctx,
        )
        .await
    }

    /// Cancel the authorization or a same-day capture or sale
    #[instrument(
        skip(self, request, ctx),
        fields(group_id = %request.group_id, key = %request.idempotency_key)
    )]
    pub async fn void(
        &self,
        request: VoidRequest,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        self.run_follow_up(
            TransactionType::Void,
            request.group_id,
            None,
            request.idempotency_key,
            ctx,
        )
        .await
    }

    /// Current settlement state of a group
    pub async fn group_state(&self, group_id: Uuid) -> Result<GroupState, TransactionError> {
        let records = self.group_records(group_id).await?;
        Ok(GroupState::from_records(&records))
    }

    /// All records of a group in creation order
    pub async fn group_records(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<TransactionRecord>, TransactionError> {
        let records = self.store.load_group(group_id).await?;
        if records.is_empty() {
            return Err(ValidationError::NotFound(group_id).into());
        }
        Ok(records)
    }

    /// Records still pending after `older_than`, for reconciliation
    pub async fn pending_records(
        &self,
        older_than: Duration,
    ) -> Result<Vec<StoredRecord>, TransactionError> {
        let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(self.store.pending_records(Utc::now() - age).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TransactionRecord>, TransactionError> {
        Ok(self.store.find(id).await?.map(|stored| stored.record))
    }

    async fn run_root(
        &self,
        txn_type: TransactionType,
        merchant_id: String,
        amount: i64,
        payment_token: String,
        key: String,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        check_key(&key)?;
        if merchant_id.trim().is_empty() {
            return Err(ValidationError::MissingMerchant.into());
        }
        if matches!(txn_type, TransactionType::Auth | TransactionType::Sale) && amount <= 0 {
            return Err(ValidationError::InvalidAmount(amount).into());
        }

        let fingerprint = request_fingerprint(txn_type, &merchant_id, None, amount);
        let existing = self
            .resolver
            .resolve(&key, &fingerprint, &ctx.cancel, ctx.deadline)
            .await?;
        let resolution = match existing {
            Some(resolution) => resolution,
            None => {
                let new = NewRecord::root(merchant_id, txn_type, amount, key);
                self.resolver.begin(new, &ctx.cancel, ctx.deadline).await?
            }
        };

        self.complete(resolution, Some(payment_token), ctx).await
    }

    async fn run_follow_up(
        &self,
        txn_type: TransactionType,
        group_id: Uuid,
        amount: Option<i64>,
        key: String,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        check_key(&key)?;
        if let Some(amount) = amount {
            if amount <= 0 {
                return Err(ValidationError::InvalidAmount(amount).into());
            }
        }

        // The root never changes once written, so the merchant can be read outside
        // the unit of work that validates and inserts
        let merchant_id = match self.store.find(group_id).await? {
            Some(stored) if stored.record.is_root() => stored.record.merchant_id,
            _ => return Err(ValidationError::NotFound(group_id).into()),
        };

        let fingerprint =
            request_fingerprint(txn_type, &merchant_id, Some(group_id), amount.unwrap_or(0));
        let existing = self
            .resolver
            .resolve(&key, &fingerprint, &ctx.cancel, ctx.deadline)
            .await?;
        let resolution = match existing {
            Some(resolution) => resolution,
            None => {
                let rules = self.rules;
                let bound_key = key.clone();
                let bound_fingerprint = fingerprint.clone();
                let build = move |records: &[TransactionRecord]| -> Result<NewRecord, ValidationError> {
                    let state = GroupState::from_records(records);
                    let (parent_id, amount) =
                        validate_follow_up(rules, txn_type, group_id, &state, amount, Utc::now())?;
                    debug!(%parent_id, amount, "Operation is legal for group state");

                    let mut new = NewRecord::child(
                        group_id,
                        parent_id,
                        merchant_id,
                        txn_type,
                        amount,
                        bound_key,
                    );
                    // VOID amounts come from the group, so the key binds to the request alone
                    new.request_fingerprint = bound_fingerprint;
                    Ok(new)
                };
                self.resolver
                    .begin_in_group(group_id, &key, &fingerprint, build, &ctx.cancel, ctx.deadline)
                    .await?
            }
        };

        self.complete(resolution, None, ctx).await
    }

    /// Drive a resolution to a terminal response
    async fn complete(
        &self,
        mut resolution: Resolution,
        payment_token: Option<String>,
        ctx: &CallContext,
    ) -> Result<TransactionResponse, TransactionError> {
        loop {
            let (record, lease, resumed) = match resolution {
                Resolution::Completed(record) => {
                    info!(
                        record_id = %record.id,
                        status = %record.status,
                        "Idempotency key already settled, returning original outcome"
                    );
                    return Ok(TransactionResponse::replay(record));
                }
                Resolution::Owned {
                    record,
                    lease,
                    resumed,
                } => (record, lease, resumed),
            };

            let original_token = match record.parent_id {
                Some(parent_id) => match self.store.load_group(record.group_id).await {
                    Ok(records) => token_of(&GroupState::from_records(&records), parent_id),
                    Err(err) => {
                        self.release(&record, &lease).await;
                        return Err(err.into());
                    }
                },
                None => None,
            };

            let request = GatewayRequest {
                operation: record.txn_type,
                merchant_id: record.merchant_id.clone(),
                amount: record.amount,
                reference: record.gateway_reference,
                original_token,
                payment_token: payment_token.clone(),
            };

            let response = match self.client.send(&request, &ctx.cancel, ctx.deadline).await {
                Ok(response) => response,
                Err(err) => {
                    self.release(&record, &lease).await;
                    return Err(err.into());
                }
            };

            let settlement = Settlement {
                status: match response.status {
                    ResponseStatus::Approved => RecordStatus::Approved,
                    ResponseStatus::Declined => RecordStatus::Declined,
                },
                response_code: response.response_code,
                response_message: response.message,
                external_token: response.external_token,
                settled_at: response.settled_at,
            };

            match self.store.settle(record.id, lease.owner, settlement).await {
                Ok(settled) => {
                    info!(
                        record_id = %settled.id,
                        txn_type = %settled.txn_type,
                        status = %settled.status,
                        response_code = settled.response_code.as_deref().unwrap_or(""),
                        resumed,
                        "Transaction settled"
                    );
                    return Ok(TransactionResponse::fresh(settled));
                }
                Err(StoreError::LeaseLost(id)) => {
                    warn!(record_id = %id, "Lease lapsed during gateway call, deferring to current owner");
                    resolution = self
                        .resolver
                        .resolve(
                            &record.idempotency_key,
                            &record.request_fingerprint,
                            &ctx.cancel,
                            ctx.deadline,
                        )
                        .await?
                        .ok_or(StoreError::NotFound(id))?;
                }
                Err(err) => {
                    self.release(&record, &lease).await;
                    return Err(err.into());
                }
            }
        }
    }

    async fn release(&self, record: &TransactionRecord, lease: &Lease) {
        if let Err(e) = self.resolver.release(record, lease).await {
            // The lease still expires on its own
            warn!(record_id = %record.id, error = %e, "Failed to release lease");
        }
    }
}

fn check_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::MissingKey);
    }
    Ok(())
}

/// Token the gateway issued for a record of the group
fn token_of(state: &GroupState, record_id: Uuid) -> Option<String> {
    if state.root_id == Some(record_id) {
        return state.root_token.clone();
    }
    state
        .captures
        .iter()
        .find(|c| c.id == record_id)
        .and_then(|c| c.token.clone())
}

/// Check a follow-up operation against the group state.
///
/// Returns the record the operation targets and the amount to record.
fn validate_follow_up(
    rules: BusinessRules,
    txn_type: TransactionType,
    group_id: Uuid,
    state: &GroupState,
    amount: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(Uuid, i64), ValidationError> {
    let (root_id, root_type) = match (state.root_id, state.root_type) {
        (Some(id), Some(root_type)) => (id, root_type),
        _ => return Err(ValidationError::RootNotApproved(group_id)),
    };
    let unsupported = ValidationError::UnsupportedOperation {
        operation: txn_type,
        root: root_type,
    };
    let amount = amount.unwrap_or(0);

    match txn_type {
        TransactionType::Capture => {
            if root_type != TransactionType::Auth {
                return Err(unsupported);
            }
            if state.voided {
                return Err(ValidationError::Voided(group_id));
            }
            if state.pending_voids > 0 {
                return Err(ValidationError::OperationInFlight(group_id));
            }
            if !rules.multi_capture && (state.active_capture_count() > 0 || state.reserved_capture > 0) {
                return Err(ValidationError::MultiCaptureDisabled);
            }
            if !state.can_capture(amount) {
                return Err(ValidationError::CaptureExceedsAuthorization {
                    requested: amount,
                    remaining: state.available_to_capture(),
                });
            }
            Ok((root_id, amount))
        }
        TransactionType::Refund => {
            if !matches!(root_type, TransactionType::Auth | TransactionType::Sale) {
                return Err(unsupported);
            }
            if state.pending_voids > 0 {
                return Err(ValidationError::OperationInFlight(group_id));
            }
            if !state.can_refund(amount) {
                return Err(ValidationError::RefundExceedsCaptured {
                    requested: amount,
                    remaining: state.available_to_refund(),
                });
            }
            Ok((state.preferred_record.unwrap_or(root_id), amount))
        }
        TransactionType::Void => {
            if !matches!(root_type, TransactionType::Auth | TransactionType::Sale) {
                return Err(unsupported);
            }
            if state.voided {
                return Err(ValidationError::Voided(group_id));
            }
            // The target depends on settled amounts, so wait for them to settle
            if state.has_pending_follow_up() {
                return Err(ValidationError::OperationInFlight(group_id));
            }
            let target = state
                .void_target(now)
                .ok_or(ValidationError::NotVoidable(group_id))?;
            let amount = match target {
                VoidTarget::Root(_) if root_type == TransactionType::Auth => {
                    state.remaining_capturable()
                }
                VoidTarget::Root(_) => state.authorized_amount,
                VoidTarget::Capture(id) => state
                    .captures
                    .iter()
                    .find(|c| c.id == id)
                    .map(|c| c.amount)
                    .unwrap_or(0),
            };
            Ok((target.id(), amount))
        }
        TransactionType::Auth
        | TransactionType::Sale
        | TransactionType::Storage
        | TransactionType::PreNote => Err(unsupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CaptureEntry;

    fn auth_state(authorized: i64) -> GroupState {
        GroupState {
            root_id: Some(Uuid::new_v4()),
            root_type: Some(TransactionType::Auth),
            root_token: Some("auth-tok".to_string()),
            root_settled_at: Some(Utc::now()),
            authorized_amount: authorized,
            ..Default::default()
        }
    }

    fn capture(amount: i64) -> CaptureEntry {
        CaptureEntry {
            id: Uuid::new_v4(),
            amount,
            token: Some(format!("cap-{}", amount)),
            settled_at: Utc::now(),
            voided: false,
        }
    }

    #[test]
    fn test_capture_needs_approved_root() {
        let group = Uuid::new_v4();
        let err = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Capture,
            group,
            &GroupState::default(),
            Some(10),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::RootNotApproved(group));
    }

    #[test]
    fn test_capture_beyond_authorization() {
        let mut state = auth_state(100);
        state.captured_amount = 100;
        state.captures = vec![capture(60), capture(40)];

        let err = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Capture,
            Uuid::new_v4(),
            &state,
            Some(1),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::CaptureExceedsAuthorization {
                requested: 1,
                remaining: 0
            }
        );
    }

    #[test]
    fn test_single_capture_rule() {
        let mut state = auth_state(100);
        state.captured_amount = 40;
        state.captures = vec![capture(40)];
        let rules = BusinessRules {
            multi_capture: false,
        };

        let err = validate_follow_up(
            rules,
            TransactionType::Capture,
            Uuid::new_v4(),
            &state,
            Some(10),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MultiCaptureDisabled);
    }

    #[test]
    fn test_capture_on_sale_is_unsupported() {
        let mut state = auth_state(100);
        state.root_type = Some(TransactionType::Sale);

        let err = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Capture,
            Uuid::new_v4(),
            &state,
            Some(10),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_refund_targets_latest_capture() {
        let mut state = auth_state(100);
        let first = capture(60);
        let second = capture(40);
        state.captured_amount = 100;
        state.preferred_record = Some(second.id);
        state.preferred_token = second.token.clone();
        state.captures = vec![first, second.clone()];

        let (parent, amount) = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Refund,
            Uuid::new_v4(),
            &state,
            Some(30),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(parent, second.id);
        assert_eq!(amount, 30);
        assert_eq!(token_of(&state, parent), second.token);
    }

    #[test]
    fn test_void_uncaptured_auth_releases_hold() {
        let state = auth_state(100);
        let root = state.root_id.unwrap();

        let (parent, amount) = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Void,
            Uuid::new_v4(),
            &state,
            None,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(parent, root);
        assert_eq!(amount, 100);
        assert_eq!(token_of(&state, parent).as_deref(), Some("auth-tok"));
    }

    #[test]
    fn test_voided_group_rejects_capture() {
        let mut state = auth_state(0);
        state.voided = true;
        let group = Uuid::new_v4();

        let err = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Capture,
            group,
            &state,
            Some(10),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Voided(group));
    }

    #[test]
    fn test_in_flight_capture_holds_its_amount() {
        let mut state = auth_state(100);
        state.reserved_capture = 60;

        let err = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Capture,
            Uuid::new_v4(),
            &state,
            Some(60),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::CaptureExceedsAuthorization {
                requested: 60,
                remaining: 40
            }
        );
    }

    #[test]
    fn test_capture_amount_overflow_is_rejected() {
        let mut state = auth_state(100);
        state.captured_amount = 60;
        state.captures = vec![capture(60)];

        let err = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Capture,
            Uuid::new_v4(),
            &state,
            Some(i64::MAX),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::CaptureExceedsAuthorization { remaining: 40, .. }
        ));
    }

    #[test]
    fn test_pending_void_blocks_capture_and_refund() {
        let mut state = auth_state(100);
        state.captured_amount = 40;
        state.captures = vec![capture(40)];
        state.pending_voids = 1;
        let group = Uuid::new_v4();

        for (txn_type, amount) in [(TransactionType::Capture, 10), (TransactionType::Refund, 10)] {
            let err = validate_follow_up(
                BusinessRules::default(),
                txn_type,
                group,
                &state,
                Some(amount),
                Utc::now(),
            )
            .unwrap_err();
            assert_eq!(err, ValidationError::OperationInFlight(group));
        }
    }

    #[test]
    fn test_void_waits_for_pending_capture() {
        let mut state = auth_state(100);
        state.reserved_capture = 30;
        let group = Uuid::new_v4();

        let err = validate_follow_up(
            BusinessRules::default(),
            TransactionType::Void,
            group,
            &state,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::OperationInFlight(group));
    }

    #[test]
    fn test_single_capture_rule_counts_pending_capture() {
        let mut state = auth_state(100);
        state.reserved_capture = 10;
        let rules = BusinessRules {
            multi_capture: false,
        };

        let err = validate_follow_up(
            rules,
            TransactionType::Capture,
            Uuid::new_v4(),
            &state,
            Some(10),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MultiCaptureDisabled);
    }

    #[test]
    fn test_payment_request_debug_redacts_token() {
        let request = PaymentRequest {
            merchant_id: "m-1".to_string(),
            amount: 100,
            payment_token: "4111111111111111".to_string(),
            idempotency_key: "k".to_string(),
        };
        let rendered = format!("{:?}", request);
        assert!(!rendered.contains("4111"));
        assert!(rendered.contains("<redacted>"));
    }
}
