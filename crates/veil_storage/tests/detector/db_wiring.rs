#![forbid(unsafe_code)]

use veil_kernel_contracts::detector::{
    DetectorEventId, DetectorEventKind, DetectorSessionState, Identity, MetricRecord, ResultRecord,
};
use veil_kernel_contracts::fhe::{CipherWidth, CiphertextHandle};
use veil_storage::detector_store::{metrics_fingerprint, DetectorStore, StorageError};
use veil_storage::repo::DetectorRepo;

fn owner_a() -> Identity {
    Identity::new("dbw_det_owner_a").unwrap()
}

fn owner_b() -> Identity {
    Identity::new("dbw_det_owner_b").unwrap()
}

fn handle(width: CipherWidth, tag: u8) -> CiphertextHandle {
    CiphertextHandle::from_backend_bytes(width, vec![tag; 32]).unwrap()
}

fn metrics(tag: u8) -> MetricRecord {
    MetricRecord::v1(
        handle(CipherWidth::U64, tag),
        handle(CipherWidth::U64, tag + 1),
        handle(CipherWidth::U64, tag + 2),
    )
    .unwrap()
}

fn result(tag: u8) -> ResultRecord {
    ResultRecord::v1(handle(CipherWidth::Bool, tag), handle(CipherWidth::U64, tag + 1)).unwrap()
}

#[test]
fn at_det_db_01_unseen_identity_is_empty() {
    let s = DetectorStore::new_in_memory();
    assert_eq!(s.session_state_row(&owner_a()), DetectorSessionState::Empty);
    assert!(s.metrics_row(&owner_a()).is_none());
    assert!(s.result_row(&owner_a()).is_none());
    assert!(s.event_rows().is_empty());
}

#[test]
fn at_det_db_02_result_requires_metrics() {
    let mut s = DetectorStore::new_in_memory();
    let err = s.upsert_result_row(&owner_a(), result(1)).unwrap_err();
    assert_eq!(
        err,
        StorageError::NoMetrics {
            identity: "dbw_det_owner_a".to_string()
        }
    );
    assert_eq!(s.session_state_row(&owner_a()), DetectorSessionState::Empty);
    assert!(s.event_rows().is_empty());
    s.check_invariants().unwrap();
}

#[test]
fn at_det_db_03_submit_evaluate_resubmit_lifecycle() {
    let mut s = DetectorStore::new_in_memory();
    let a = owner_a();

    let ev = s.upsert_metrics_row(&a, metrics(10)).unwrap();
    assert_eq!(ev.kind, DetectorEventKind::MetricsSubmitted);
    assert_eq!(ev.event_id, DetectorEventId(1));
    assert_eq!(ev.fingerprint, metrics_fingerprint(&metrics(10)));
    assert_eq!(s.session_state_row(&a), DetectorSessionState::HasMetrics);

    let ev = s.upsert_result_row(&a, result(20)).unwrap();
    assert_eq!(ev.kind, DetectorEventKind::DetectionCompleted);
    assert_eq!(s.session_state_row(&a), DetectorSessionState::HasResult);
    assert_eq!(s.result_row(&a), Some(&result(20)));

    s.upsert_metrics_row(&a, metrics(40)).unwrap();
    assert_eq!(s.session_state_row(&a), DetectorSessionState::HasMetrics);
    assert!(s.result_row(&a).is_none());
    assert_eq!(s.metrics_row(&a), Some(&metrics(40)));
    s.check_invariants().unwrap();
}

#[test]
fn at_det_db_04_reevaluation_overwrites_result() {
    let mut s = DetectorStore::new_in_memory();
    let a = owner_a();
    s.upsert_metrics_row(&a, metrics(10)).unwrap();
    s.upsert_result_row(&a, result(20)).unwrap();
    s.upsert_result_row(&a, result(50)).unwrap();
    assert_eq!(s.result_row(&a), Some(&result(50)));
    assert_eq!(s.session_state_row(&a), DetectorSessionState::HasResult);
    assert_eq!(s.event_rows_by_identity(&a).len(), 3);
}

#[test]
fn at_det_db_05_identity_isolation() {
    let mut s = DetectorStore::new_in_memory();
    s.upsert_metrics_row(&owner_a(), metrics(10)).unwrap();
    s.upsert_result_row(&owner_a(), result(20)).unwrap();

    s.upsert_metrics_row(&owner_b(), metrics(60)).unwrap();
    assert_eq!(s.session_state_row(&owner_a()), DetectorSessionState::HasResult);
    assert_eq!(s.result_row(&owner_a()), Some(&result(20)));
    assert_eq!(s.metrics_row(&owner_a()), Some(&metrics(10)));
    assert_eq!(s.event_rows_by_identity(&owner_b()).len(), 1);
    s.check_invariants().unwrap();
}

#[test]
fn at_det_db_06_event_ledger_is_append_only() {
    let mut s = DetectorStore::new_in_memory();
    s.upsert_metrics_row(&owner_a(), metrics(10)).unwrap();
    assert_eq!(
        s.attempt_overwrite_event(DetectorEventId(1)),
        Err(StorageError::AppendOnlyViolation {
            table: "detector_events"
        })
    );
    assert_eq!(s.event_rows().len(), 1);
}

#[test]
fn at_det_db_07_event_ids_are_monotonic() {
    let mut s = DetectorStore::new_in_memory();
    s.upsert_metrics_row(&owner_a(), metrics(10)).unwrap();
    s.upsert_metrics_row(&owner_b(), metrics(11)).unwrap();
    s.upsert_result_row(&owner_a(), result(12)).unwrap();
    let ids: Vec<u64> = s.event_rows().iter().map(|e| e.event_id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}
