//! Settlement state of a transaction group, derived by replaying its records.
//!
//! There is no stored "current status" anywhere in the ledger. Every caller
//! folds the group's records into a fresh [`GroupState`] and throws it away
//! afterwards, so the derived view can never drift from the facts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::record::{TransactionRecord, TransactionType};

/// An approved capture seen during the fold
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureEntry {
    pub id: Uuid,
    pub amount: i64,
    pub token: Option<String>,
    pub settled_at: DateTime<Utc>,
    pub voided: bool,
}

/// Record a VOID would cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidTarget {
    /// The root AUTH (or same-day SALE)
    Root(Uuid),

    /// A same-day CAPTURE
    Capture(Uuid),
}

impl VoidTarget {
    pub fn id(&self) -> Uuid {
        match self {
            VoidTarget::Root(id) | VoidTarget::Capture(id) => *id,
        }
    }
}

/// Derived settlement amounts of one group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupState {
    /// Root record of the group, once an approved root has been seen
    pub root_id: Option<Uuid>,
    pub root_type: Option<TransactionType>,
    pub root_token: Option<String>,
    pub root_settled_at: Option<DateTime<Utc>>,

    pub authorized_amount: i64,
    pub captured_amount: i64,
    pub refunded_amount: i64,
    pub voided: bool,

    /// Token the next dependent REFUND should reference
    pub preferred_token: Option<String>,

    /// Record that owns `preferred_token`
    pub preferred_record: Option<Uuid>,

    /// Approved captures in creation order
    pub captures: Vec<CaptureEntry>,

    /// Amount of CAPTUREs still pending at the gateway
    pub reserved_capture: i64,

    /// Amount of REFUNDs still pending at the gateway
    pub reserved_refund: i64,

    /// Number of VOIDs still pending at the gateway
    pub pending_voids: usize,
}

impl GroupState {
    /// Fold a group's records into its current state.
    ///
    /// Records are replayed in creation order regardless of the order they
    /// are passed in. Declined records are skipped. Pending follow-ups do not
    /// move settled amounts; they are tallied as reservations, since each may
    /// still reach the gateway when its attempt resumes.
    pub fn from_records(records: &[TransactionRecord]) -> Self {
        let mut ordered: Vec<&TransactionRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.created_at);

        let by_id: HashMap<Uuid, &TransactionRecord> =
            records.iter().map(|r| (r.id, r)).collect();

        let mut state = Self::default();
        for record in ordered {
            state.apply(record, &by_id);
        }
        state
    }

    fn apply(&mut self, record: &TransactionRecord, by_id: &HashMap<Uuid, &TransactionRecord>) {
        if record.is_pending() {
            self.reserve(record);
            return;
        }
        if !record.is_approved() {
            return;
        }

        let settled_at = record.settled_at.unwrap_or(record.created_at);

        match record.txn_type {
            TransactionType::Auth | TransactionType::Sale => {
                self.root_id = Some(record.id);
                self.root_type = Some(record.txn_type);
                self.root_token = record.external_token.clone();
                self.root_settled_at = Some(settled_at);
                self.authorized_amount = record.amount;
            }
            TransactionType::Storage | TransactionType::PreNote => {
                self.root_id = Some(record.id);
                self.root_type = Some(record.txn_type);
                self.root_token = record.external_token.clone();
                self.root_settled_at = Some(settled_at);
            }
            TransactionType::Capture => {
                self.captured_amount = self.captured_amount.saturating_add(record.amount);
                self.captures.push(CaptureEntry {
                    id: record.id,
                    amount: record.amount,
                    token: record.external_token.clone(),
                    settled_at,
                    voided: false,
                });
            }
            TransactionType::Void => {
                let target_type = record
                    .parent_id
                    .and_then(|parent| by_id.get(&parent))
                    .map(|parent| parent.txn_type);

                match target_type {
                    Some(TransactionType::Auth) | Some(TransactionType::Sale) => {
                        self.voided = true;
                        self.authorized_amount = 0;
                    }
                    Some(TransactionType::Capture) => {
                        let parent = record.parent_id;
                        if let Some(entry) = self
                            .captures
                            .iter_mut()
                            .find(|c| Some(c.id) == parent && !c.voided)
                        {
                            entry.voided = true;
                            self.captured_amount = self.captured_amount.saturating_sub(entry.amount);
                        }
                    }
                    _ => {}
                }
            }
            TransactionType::Refund => {
                self.refunded_amount = self.refunded_amount.saturating_add(record.amount);
            }
        }

        self.refresh_preferred();
    }

    fn reserve(&mut self, record: &TransactionRecord) {
        match record.txn_type {
            TransactionType::Capture => {
                self.reserved_capture = self.reserved_capture.saturating_add(record.amount);
            }
            TransactionType::Refund => {
                self.reserved_refund = self.reserved_refund.saturating_add(record.amount);
            }
            TransactionType::Void => self.pending_voids += 1,
            _ => {}
        }
    }

    /// Most recent un-voided capture wins, otherwise the root
    fn refresh_preferred(&mut self) {
        let latest = self
            .last_active_capture()
            .map(|capture| (capture.token.clone(), capture.id));
        match latest {
            Some((token, id)) => {
                self.preferred_token = token;
                self.preferred_record = Some(id);
            }
            None => {
                self.preferred_token = self.root_token.clone();
                self.preferred_record = self.root_id;
            }
        }
    }

    fn last_active_capture(&self) -> Option<&CaptureEntry> {
        self.captures.iter().rev().find(|c| !c.voided)
    }

    /// Whether the group has no captures and a SALE root
    fn is_sale_only(&self) -> bool {
        self.root_type == Some(TransactionType::Sale) && self.captures.is_empty()
    }

    /// Amount refunds are measured against
    pub fn refund_base(&self) -> i64 {
        if self.captured_amount > 0 {
            self.captured_amount
        } else if self.is_sale_only() {
            self.authorized_amount
        } else {
            0
        }
    }

    /// Authorization not yet captured
    pub fn remaining_capturable(&self) -> i64 {
        if self.voided {
            return 0;
        }
        (self.authorized_amount - self.captured_amount).max(0)
    }

    pub fn remaining_refundable(&self) -> i64 {
        (self.refund_base() - self.refunded_amount).max(0)
    }

    /// Authorization a new CAPTURE may still claim, net of in-flight captures
    pub fn available_to_capture(&self) -> i64 {
        self.remaining_capturable().saturating_sub(self.reserved_capture).max(0)
    }

    /// Refundable amount a new REFUND may still claim, net of in-flight refunds
    pub fn available_to_refund(&self) -> i64 {
        self.remaining_refundable().saturating_sub(self.reserved_refund).max(0)
    }

    /// Whether any CAPTURE, REFUND or VOID of the group is still pending
    pub fn has_pending_follow_up(&self) -> bool {
        self.reserved_capture > 0 || self.reserved_refund > 0 || self.pending_voids > 0
    }

    /// Number of approved, un-voided captures
    pub fn active_capture_count(&self) -> usize {
        self.captures.iter().filter(|c| !c.voided).count()
    }

    /// Settled plus in-flight captures plus `amount` stay within the authorization
    pub fn can_capture(&self, amount: i64) -> bool {
        !self.voided
            && self.authorized_amount > 0
            && self
                .captured_amount
                .checked_add(self.reserved_capture)
                .and_then(|total| total.checked_add(amount))
                .is_some_and(|total| total <= self.authorized_amount)
    }

    /// Settled plus in-flight refunds plus `amount` stay within the refund base
    pub fn can_refund(&self, amount: i64) -> bool {
        let has_base =
            self.captured_amount > 0 || (self.is_sale_only() && self.authorized_amount > 0);
        has_base
            && self
                .refunded_amount
                .checked_add(self.reserved_refund)
                .and_then(|total| total.checked_add(amount))
                .is_some_and(|total| total <= self.refund_base())
    }

    /// Whether a VOID is legal at `now`
    pub fn can_void(&self, now: DateTime<Utc>) -> bool {
        self.void_target(now).is_some()
    }

    /// The record a VOID issued at `now` would cancel.
    ///
    /// A same-day capture is reversed first, as long as the remaining captured
    /// amount still covers what was refunded. Otherwise an AUTH still holding
    /// uncaptured funds is released, or a same-day SALE without refunds is
    /// cancelled.
    pub fn void_target(&self, now: DateTime<Utc>) -> Option<VoidTarget> {
        if self.voided {
            return None;
        }

        if let Some(capture) = self.last_active_capture() {
            let reversible = same_day(capture.settled_at, now)
                && self.captured_amount - capture.amount >= self.refunded_amount;
            if reversible {
                return Some(VoidTarget::Capture(capture.id));
            }
        }

        match (self.root_type, self.root_id) {
            (Some(TransactionType::Auth), Some(root)) if self.remaining_capturable() > 0 => {
                Some(VoidTarget::Root(root))
            }
            (Some(TransactionType::Sale), Some(root))
                if self.authorized_amount > 0
                    && self.refunded_amount == 0
                    && self.root_settled_at.is_some_and(|at| same_day(at, now)) =>
            {
                Some(VoidTarget::Root(root))
            }
            _ => None,
        }
    }

    /// Token a VOID of `target` should reference
    pub fn token_for(&self, target: VoidTarget) -> Option<String> {
        match target {
            VoidTarget::Root(_) => self.root_token.clone(),
            VoidTarget::Capture(id) => self
                .captures
                .iter()
                .find(|c| c.id == id)
                .and_then(|c| c.token.clone()),
        }
    }
}

fn same_day(at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    at.date_naive() == now.date_naive()
}
