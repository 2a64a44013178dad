//! Group State Integration Tests
//!
//! Group state is a pure fold over ledger records: the same records in any
//! order, on any thread, yield the same state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use payledger::domain::{ReferenceMapper, VoidTarget};
use payledger::{GroupState, RecordStatus, TransactionRecord, TransactionType};
use uuid::Uuid;

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn record(
    group_id: Uuid,
    parent_id: Option<Uuid>,
    txn_type: TransactionType,
    amount: i64,
    status: RecordStatus,
    minute: i64,
) -> TransactionRecord {
    let id = Uuid::new_v4();
    let settled = status.is_terminal();
    TransactionRecord {
        id,
        group_id,
        parent_id,
        merchant_id: "merchant-1".to_string(),
        txn_type,
        amount,
        status,
        response_code: settled.then(|| "00".to_string()),
        response_message: settled.then(|| "ok".to_string()),
        idempotency_key: format!("key-{}", id),
        request_fingerprint: "0000000000000000".to_string(),
        gateway_reference: ReferenceMapper::default().reference_for(&id),
        external_token: (status == RecordStatus::Approved).then(|| format!("tok-{}", id)),
        created_at: at(minute),
        settled_at: settled.then(|| at(minute)),
    }
}

/// AUTH 10000, two captures, a voided capture, a refund and some noise
fn busy_group() -> Vec<TransactionRecord> {
    let group = Uuid::new_v4();
    let auth = record(group, None, TransactionType::Auth, 10_000, RecordStatus::Approved, 0);
    let cap1 = record(group, Some(auth.id), TransactionType::Capture, 3_000, RecordStatus::Approved, 1);
    let cap2 = record(group, Some(auth.id), TransactionType::Capture, 2_500, RecordStatus::Approved, 2);
    let declined = record(group, Some(auth.id), TransactionType::Capture, 9_000, RecordStatus::Declined, 3);
    let void_cap2 = record(group, Some(cap2.id), TransactionType::Void, 2_500, RecordStatus::Approved, 4);
    let refund = record(group, Some(cap1.id), TransactionType::Refund, 1_000, RecordStatus::Approved, 5);
    let pending = record(group, Some(auth.id), TransactionType::Capture, 4_000, RecordStatus::Pending, 6);

    vec![auth, cap1, cap2, declined, void_cap2, refund, pending]
}

#[test]
fn test_fold_of_busy_group() {
    let records = busy_group();
    let state = GroupState::from_records(&records);

    assert_eq!(state.root_id, Some(records[0].id));
    assert_eq!(state.authorized_amount, 10_000);
    assert_eq!(state.captured_amount, 3_000);
    assert_eq!(state.refunded_amount, 1_000);
    assert_eq!(state.remaining_capturable(), 7_000);
    assert_eq!(state.remaining_refundable(), 2_000);
    assert_eq!(state.active_capture_count(), 1);
    assert_eq!(state.preferred_record, Some(records[1].id));
    assert_eq!(state.preferred_token, records[1].external_token);
    assert!(!state.voided);
}

#[test]
fn test_fold_is_repeatable() {
    let records = busy_group();
    let first = GroupState::from_records(&records);
    let second = GroupState::from_records(&records);
    assert_eq!(first, second);
}

#[test]
fn test_fold_ignores_input_order() {
    let records = busy_group();
    let expected = GroupState::from_records(&records);

    let mut reversed = records.clone();
    reversed.reverse();
    assert_eq!(GroupState::from_records(&reversed), expected);

    // Every rotation of the input yields the same state
    for shift in 1..records.len() {
        let mut rotated = records.clone();
        rotated.rotate_left(shift);
        assert_eq!(GroupState::from_records(&rotated), expected, "rotation {}", shift);
    }
}

#[test]
fn test_fold_on_many_threads_agrees() {
    let records = Arc::new(busy_group());
    let expected = GroupState::from_records(&records);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let records = Arc::clone(&records);
            std::thread::spawn(move || GroupState::from_records(&records))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn test_void_target_moves_from_capture_to_auth() {
    let group = Uuid::new_v4();
    let auth = record(group, None, TransactionType::Auth, 5_000, RecordStatus::Approved, 0);
    let capture = record(group, Some(auth.id), TransactionType::Capture, 2_000, RecordStatus::Approved, 1);

    let mut records = vec![auth.clone(), capture.clone()];
    let state = GroupState::from_records(&records);
    assert_eq!(state.void_target(at(30)), Some(VoidTarget::Capture(capture.id)));

    records.push(record(group, Some(capture.id), TransactionType::Void, 2_000, RecordStatus::Approved, 2));
    let state = GroupState::from_records(&records);
    assert_eq!(state.captured_amount, 0);
    assert_eq!(state.void_target(at(30)), Some(VoidTarget::Root(auth.id)));
    assert_eq!(state.token_for(VoidTarget::Root(auth.id)), auth.external_token);

    // Next day the capture could no longer be voided, the auth still can
    let fresh = GroupState::from_records(&records[..2]);
    assert_eq!(fresh.void_target(at(60 * 24)), Some(VoidTarget::Root(auth.id)));
}

#[test]
fn test_unsettled_root_leaves_group_empty() {
    let group = Uuid::new_v4();
    let pending = record(group, None, TransactionType::Sale, 700, RecordStatus::Pending, 0);
    let state = GroupState::from_records(&[pending]);

    assert_eq!(state, GroupState::default());
    assert!(!state.can_refund(1));
    assert!(state.void_target(at(1)).is_none());
}

#[test]
fn test_references_are_stable_and_spread() {
    let mapper = ReferenceMapper::new(12);
    let ids: Vec<Uuid> = (0..10_000).map(|_| Uuid::new_v4()).collect();

    let mut seen = HashSet::new();
    for id in &ids {
        let reference = mapper.reference_for(id);
        assert_eq!(reference, mapper.reference_for(id));
        assert!(reference < 1_000_000_000_000);
        assert_eq!(mapper.format(reference).len(), 12);
        seen.insert(reference);
    }

    // 10k ids in a 10^12 space should essentially never collide
    assert!(ids.len() - seen.len() <= 1);
}

#[test]
fn test_salted_reference_differs() {
    let mapper = ReferenceMapper::new(12);
    let id = Uuid::new_v4();
    assert_eq!(mapper.salted(&id, 0), mapper.reference_for(&id));
    let salted: HashSet<u64> = (0..5).map(|salt| mapper.salted(&id, salt)).collect();
    assert_eq!(salted.len(), 5);
}
