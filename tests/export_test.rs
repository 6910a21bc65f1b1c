//! Export bundles against the live ledger.

mod common;

use audit_ledger::audit::{verify_bundle, ExportBundle, FailureKind};
use audit_ledger::crypto::LedgerKeys;
use audit_ledger::{LedgerError, LedgerStore};
use common::*;

#[tokio::test]
async fn test_bundle_report_matches_live_report() {
    let (_store, ledger) = memory_ledger(&manual_checkpoint_config());
    record_many(&ledger, "T1", 10).await;
    ledger.checkpoint_now("T1").await.unwrap();
    record_many(&ledger, "T1", 10).await;
    ledger.checkpoint_now("T1").await.unwrap();
    record_many(&ledger, "T1", 4).await;

    for (from, to) in [(1, 24), (5, 20), (11, 20), (21, 24)] {
        let bundle = ledger.export("T1", from, to, "auditor@example.org").await.unwrap();
        let offline = verify_bundle(&bundle, &test_keys()).unwrap();
        let live = ledger.verify("T1", from, to).await.unwrap();
        assert_eq!(offline, live, "range {}..={}", from, to);
        assert!(offline.verified);
    }
}

#[tokio::test]
async fn test_bundle_report_matches_live_report_after_tampering() {
    let (store, ledger) = memory_ledger(&manual_checkpoint_config());
    record_many(&ledger, "T1", 12).await;
    ledger.checkpoint_now("T1").await.unwrap();

    store.tamper_event("T1", 7, |e| e.action = "PURGE".to_string()).await;

    let bundle = ledger.export("T1", 1, 12, "auditor").await.unwrap();
    let offline = verify_bundle(&bundle, &test_keys()).unwrap();
    let live = ledger.verify("T1", 1, 12).await.unwrap();

    assert_eq!(offline, live);
    let failure = offline.failure.unwrap();
    assert_eq!(failure.sequence, 7);
    assert_eq!(failure.kind, FailureKind::HashMismatch);
}

#[tokio::test]
async fn test_repeated_exports_are_identical() {
    let (store, ledger) = memory_ledger(&test_config());
    record_many(&ledger, "T1", 6).await;

    let first = ledger.export("T1", 2, 5, "auditor").await.unwrap();
    let second = ledger.export("T1", 2, 5, "auditor").await.unwrap();

    assert_eq!(
        serde_json::to_vec(&first.events).unwrap(),
        serde_json::to_vec(&second.events).unwrap()
    );
    assert_eq!(first.header.events_digest, second.header.events_digest);
    assert_eq!(first.header.anchor_hash, second.header.anchor_hash);

    // Exporting leaves the source untouched.
    assert_eq!(store.count_events("T1").await.unwrap(), 6);
    assert!(ledger.verify("T1", 1, 6).await.unwrap().verified);
}

#[tokio::test]
async fn test_export_since_last_walks_forward() {
    let (_store, ledger) = memory_ledger(&test_config());
    record_many(&ledger, "T1", 4).await;

    let first = ledger.export_since_last("T1", "auditor").await.unwrap();
    assert_eq!((first.header.from_sequence, first.header.to_sequence), (1, 4));

    record_many(&ledger, "T1", 3).await;
    let second = ledger.export_since_last("T1", "auditor").await.unwrap();
    assert_eq!((second.header.from_sequence, second.header.to_sequence), (5, 7));
    assert!(verify_bundle(&second, &test_keys()).unwrap().verified);

    assert!(matches!(
        ledger.export_since_last("T1", "auditor").await,
        Err(LedgerError::ExportRangeInvalid(_))
    ));
}

#[tokio::test]
async fn test_export_range_validation() {
    let (_store, ledger) = memory_ledger(&test_config());
    record_many(&ledger, "T1", 3).await;

    for (from, to) in [(0, 3), (3, 1), (1, 4)] {
        assert!(matches!(
            ledger.export("T1", from, to, "auditor").await,
            Err(LedgerError::ExportRangeInvalid(_))
        ));
    }
    assert!(matches!(
        ledger.export("T1", 1, 3, "  ").await,
        Err(LedgerError::ExportRangeInvalid(_))
    ));
}

#[tokio::test]
async fn test_bundle_file_round_trip_and_wrong_keys() {
    let (_store, ledger) = memory_ledger(&test_config());
    record_many(&ledger, "T1", 5).await;
    let bundle = ledger.export("T1", 1, 5, "auditor").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("T1-1-5.json");
    std::fs::write(&path, bundle.to_json_vec().unwrap()).unwrap();

    let loaded = ExportBundle::from_json_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(loaded, bundle);
    assert!(verify_bundle(&loaded, &test_keys()).unwrap().verified);

    let other = LedgerKeys::new(
        "another-event-key-0123456789abcdef0123",
        "another-checkpoint-key-0123456789abcdef",
    )
    .unwrap();
    assert!(matches!(verify_bundle(&loaded, &other), Err(LedgerError::Crypto(_))));
}

#[tokio::test]
async fn test_truncated_bundle_rejected() {
    let (_store, ledger) = memory_ledger(&test_config());
    record_many(&ledger, "T1", 5).await;
    let mut bundle = ledger.export("T1", 1, 5, "auditor").await.unwrap();

    bundle.events.pop();
    assert!(matches!(verify_bundle(&bundle, &test_keys()), Err(LedgerError::Crypto(_))));

    bundle.header.to_sequence = 4;
    assert!(matches!(verify_bundle(&bundle, &test_keys()), Err(LedgerError::Crypto(_))));
}
