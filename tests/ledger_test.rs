//! End-to-end behaviour of the ledger over the in-memory store.

mod common;

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use audit_ledger::audit::{ManualClock, NewEvent, GENESIS_HASH};
use audit_ledger::{AuditLedger, LedgerError, LedgerStore, MemoryLedgerStore};
use common::*;

#[tokio::test]
async fn test_first_event_of_new_tenant() {
    let (store, ledger) = memory_ledger(&test_config());

    let event = ledger
        .record(
            NewEvent::new("T1", "lab1", "LOGIN", "user", "u-17", "req-1")
                .with_details(serde_json::json!({ "method": "password" })),
        )
        .await
        .unwrap();

    assert_eq!(event.sequence, 1);
    assert_eq!(event.prev_hash, GENESIS_HASH);
    assert!(event.verify_hash(&test_keys().event));

    let report = ledger.verify("T1", 1, 1).await.unwrap();
    assert!(report.verified);
    assert_eq!(report.checked, 1);

    // Below the checkpoint threshold.
    assert_eq!(store.count_checkpoints("T1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_tenants_have_independent_chains() {
    let (_store, ledger) = memory_ledger(&test_config());

    let a = record_many(&ledger, "T1", 3).await;
    let b = record_many(&ledger, "T2", 2).await;

    assert_eq!(a.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(b.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(b[0].prev_hash, GENESIS_HASH);
    assert_eq!(a[2].prev_hash, a[1].event_hash);

    assert!(ledger.verify("T1", 1, 3).await.unwrap().verified);
    assert!(ledger.verify("T2", 1, 2).await.unwrap().verified);
}

#[tokio::test]
async fn test_invalid_input_rejected() {
    let (_store, ledger) = memory_ledger(&test_config());

    let blank_actor = NewEvent::new("T1", "", "LOGIN", "user", "u-1", "req-1");
    assert!(matches!(ledger.record(blank_actor).await, Err(LedgerError::InvalidEvent(_))));

    record_many(&ledger, "T1", 2).await;
    assert!(matches!(ledger.verify("T1", 0, 2).await, Err(LedgerError::InvalidRange(_))));
    assert!(matches!(ledger.verify("T1", 3, 2).await, Err(LedgerError::InvalidRange(_))));
    assert!(matches!(ledger.verify_all("T9").await, Err(LedgerError::NotFound(_))));
    assert!(matches!(ledger.verify_entry("T1", 7).await, Err(LedgerError::NotFound(_))));
}

#[tokio::test]
async fn test_clock_moving_backwards() {
    let store = Arc::new(MemoryLedgerStore::new());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
    let ledger = AuditLedger::with_clock(store, &test_config(), clock.clone()).unwrap();

    let first = ledger.record(login("T1", 1)).await.unwrap();
    clock.advance(Duration::hours(-1));
    let second = ledger.record(login("T1", 2)).await.unwrap();
    let third = ledger.record(login("T1", 3)).await.unwrap();

    assert!(second.timestamp > first.timestamp);
    assert!(third.timestamp > second.timestamp);
    assert!(ledger.verify("T1", 1, 3).await.unwrap().verified);
}

#[tokio::test]
async fn test_health_and_summary() {
    let (_store, ledger) = memory_ledger(&manual_checkpoint_config());
    record_many(&ledger, "T1", 7).await;
    ledger.checkpoint_now("T1").await.unwrap().unwrap();
    record_many(&ledger, "T1", 3).await;

    let health = ledger.health("T1").await.unwrap();
    assert_eq!(health.last_sequence, 10);
    assert_eq!(health.last_checkpoint_sequence, Some(7));
    assert_eq!(health.events_since_checkpoint, 3);
    assert_eq!(health.checkpoint_failures, 0);
    assert!(health.last_checkpoint_age_ms.unwrap() >= 0);

    let summary = ledger.summary("T1").await.unwrap();
    assert_eq!(summary.total_events, 10);
    assert_eq!(summary.last_sequence, 10);
    assert_eq!(summary.checkpoint_count, 1);
    assert!(summary.integrity.verified);
    assert_eq!(summary.integrity.sampled_events, 10);

    let empty = ledger.summary("T9").await.unwrap();
    assert_eq!(empty.total_events, 0);
    assert!(empty.last_timestamp.is_none());
}

#[tokio::test]
async fn test_checkpoint_after_threshold() {
    let mut config = test_config();
    config.checkpoint.every_events = 5;
    let (store, ledger) = memory_ledger(&config);

    record_many(&ledger, "T1", 4).await;
    assert_eq!(store.count_checkpoints("T1").await.unwrap(), 0);

    record_many(&ledger, "T1", 1).await;
    let store_ref = store.clone();
    assert!(eventually(|| {
        let store = store_ref.clone();
        async move { store.count_checkpoints("T1").await.unwrap() == 1 }
    })
    .await);

    let checkpoint = store.last_checkpoint("T1").await.unwrap().unwrap();
    assert_eq!(checkpoint.from_sequence, 1);
    assert_eq!(checkpoint.upto_sequence, 5);

    let report = ledger.verify("T1", 1, 5).await.unwrap();
    assert!(report.verified);
    assert_eq!(report.checkpoints_checked, 1);
}

#[tokio::test]
async fn test_checkpoint_digest_is_reproducible() {
    let (_store, ledger) = memory_ledger(&manual_checkpoint_config());
    record_many(&ledger, "T1", 12).await;

    let checkpoint = ledger.checkpoint_now("T1").await.unwrap().unwrap();
    let manager = ledger.checkpoint_manager();
    assert_eq!(manager.recompute_digest(&checkpoint).await.unwrap(), checkpoint.digest);
    assert_eq!(manager.recompute_digest(&checkpoint).await.unwrap(), checkpoint.digest);
    assert!(checkpoint.verify_signature(&test_keys().checkpoint));
}

#[tokio::test]
async fn test_verification_spans_checkpoint_chunks() {
    let (_store, ledger) = memory_ledger(&manual_checkpoint_config());
    for _ in 0..4 {
        record_many(&ledger, "T1", 10).await;
        ledger.checkpoint_now("T1").await.unwrap().unwrap();
    }
    record_many(&ledger, "T1", 5).await;

    let report = ledger.verify("T1", 1, 45).await.unwrap();
    assert!(report.verified);
    assert_eq!(report.checked, 45);
    assert_eq!(report.checkpoints_checked, 4);

    // A range starting mid-checkpoint only checks the ones fully inside.
    let partial = ledger.verify("T1", 15, 45).await.unwrap();
    assert!(partial.verified);
    assert_eq!(partial.checked, 31);
    assert_eq!(partial.checkpoints_checked, 2);
}

#[tokio::test]
async fn test_scheduler_checkpoints_by_time_and_stops() {
    let mut config = test_config();
    config.checkpoint.every_events = 1_000;
    config.checkpoint.interval_secs = 0;
    config.checkpoint.poll_interval_secs = 1;
    let (store, ledger) = memory_ledger(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = ledger.spawn_checkpoint_scheduler(shutdown_rx).unwrap();

    record_many(&ledger, "T1", 3).await;
    let store_ref = store.clone();
    let created = async {
        for _ in 0..40 {
            if store_ref.count_checkpoints("T1").await.unwrap() >= 1 {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        false
    }
    .await;
    assert!(created);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_scheduler_disabled() {
    let (_store, ledger) = memory_ledger(&manual_checkpoint_config());
    let (_tx, rx) = watch::channel(false);
    assert!(ledger.spawn_checkpoint_scheduler(rx).is_none());
}

#[tokio::test]
async fn test_login_screening_export_scenario() {
    let (_store, ledger) = memory_ledger(&test_config());

    let drafts = [
        ("lab1", "LOGIN", "user", "lab1"),
        ("lab1", "SCREEN_B12", "screening", "s-204"),
        ("admin1", "EXPORT_AUDIT", "ledger", "T1"),
    ];
    let mut recorded = Vec::new();
    for (n, (actor, action, entity_type, entity_id)) in drafts.iter().enumerate() {
        let event = ledger
            .record(NewEvent::new("T1", *actor, *action, *entity_type, *entity_id, format!("req-{}", n)))
            .await
            .unwrap();
        recorded.push(event);
    }

    assert_eq!(recorded.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(ledger.verify("T1", 1, 3).await.unwrap().verified);

    let bundle = ledger.export("T1", 1, 3, "admin1").await.unwrap();
    assert_eq!(bundle.events, recorded);
    assert_eq!(
        bundle
            .events
            .iter()
            .map(|e| (e.actor.as_str(), e.action.as_str()))
            .collect::<Vec<_>>(),
        vec![("lab1", "LOGIN"), ("lab1", "SCREEN_B12"), ("admin1", "EXPORT_AUDIT")]
    );
    assert!(bundle.checkpoints.is_empty());
    assert_eq!(bundle.header.event_count, 3);
}
