//! Crash recovery tests
//!
//! A request is cut off mid-flight by stalling one backend index and then
//! dropping the whole gateway context. A fresh instance's reaper pass must
//! leave only what the surviving metadata references.

use s3gw::metadata::BucketIndexes;
use s3gw::{
    put_object, ClientConnection, ExtendedMetadata, FaultPlan, GatewayConfig, GatewayContext, GatewayError,
    InMemoryBackend, ObjectMetadata, PutObject, PutRequest, Reaper, ShutdownSignal,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn config(instance: &str) -> GatewayConfig {
    GatewayConfig::default()
        .with_instance_id(instance)
        .with_failures_before_fragment(1)
        .with_join_wait_timeout(Duration::from_millis(200))
}

/// Start a fragmented put that hangs on the extended-metadata save, then crash
fn crash_during_save(backend: &Arc<InMemoryBackend>, key: &str, body: Vec<u8>) {
    let ctx = GatewayContext::new(config("crashed"), backend.clone(), ShutdownSignal::new()).unwrap();
    let indexes = BucketIndexes::derive("vault");
    backend.set_faults(FaultPlan::new().stall_index(indexes.extended));
    backend.fail_next_writes(1);

    let put = PutObject::new(ctx.clone(), PutRequest::new("vault", key, body), ClientConnection::new());
    put.start();
    let err = ctx.run_until_idle().unwrap_err();
    assert!(matches!(err, GatewayError::Stalled { .. }));
    assert!(!put.is_finished());

    drop(put);
    drop(ctx);
    backend.clear_faults();
}

fn live_metadata(backend: &InMemoryBackend, key: &str) -> Option<ObjectMetadata> {
    let indexes = BucketIndexes::derive("vault");
    backend
        .kv_value(indexes.object_list, key)
        .map(|text| ObjectMetadata::from_json(&text).unwrap())
}

#[test]
fn test_reaper_removes_objects_of_crashed_create() {
    let backend = Arc::new(InMemoryBackend::new(4));
    crash_during_save(&backend, "new.bin", vec![5u8; 4000]);

    // Primary and one fragment were created before the crash.
    assert_eq!(backend.object_count(), 2);
    let ledger_index = s3gw::config::DEFAULT_LEDGER_INDEX;
    assert_eq!(backend.kv_entries(ledger_index).len(), 2);
    assert!(live_metadata(&backend, "new.bin").is_none());

    let ctx = GatewayContext::new(config("survivor"), backend.clone(), ShutdownSignal::new()).unwrap();
    let active: HashSet<String> = ["survivor".to_string()].into_iter().collect();
    let report = Reaper::new(ctx).run_pass(&active).unwrap();

    assert_eq!(report.examined, 2);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.retired, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(backend.object_count(), 0);
    assert!(backend.kv_entries(ledger_index).is_empty());
}

#[test]
fn test_reaper_keeps_object_a_crashed_overwrite_would_replace() {
    let backend = Arc::new(InMemoryBackend::new(4));
    {
        let ctx = GatewayContext::new(config("writer"), backend.clone(), ShutdownSignal::new()).unwrap();
        let outcome = put_object(&ctx, PutRequest::new("vault", "doc.txt", vec![1u8; 1500])).unwrap();
        assert!(outcome.succeeded());
    }
    let old = live_metadata(&backend, "doc.txt").unwrap();

    crash_during_save(&backend, "doc.txt", vec![2u8; 3000]);
    assert_eq!(backend.object_count(), 3);
    // New primary, its fragment and the superseded old object are all recorded.
    let ledger_index = s3gw::config::DEFAULT_LEDGER_INDEX;
    assert_eq!(backend.kv_entries(ledger_index).len(), 3);

    let ctx = GatewayContext::new(config("survivor"), backend.clone(), ShutdownSignal::new()).unwrap();
    let report = Reaper::new(ctx).run_pass(&HashSet::new()).unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.retired, 3);

    assert_eq!(backend.object_ids(), vec![old.object_id]);
    assert_eq!(live_metadata(&backend, "doc.txt").unwrap(), old);
    assert_eq!(backend.object_data(old.object_id).unwrap(), vec![1u8; 1500]);
    assert!(backend.kv_entries(ledger_index).is_empty());
}

#[test]
fn test_records_of_running_instance_survive_a_pass() {
    let backend = Arc::new(InMemoryBackend::new(4));
    crash_during_save(&backend, "held.bin", vec![7u8; 2000]);

    let ctx = GatewayContext::new(config("survivor"), backend.clone(), ShutdownSignal::new()).unwrap();
    let active: HashSet<String> = ["crashed".to_string()].into_iter().collect();
    let report = Reaper::new(ctx).run_pass(&active).unwrap();

    assert_eq!(report.examined, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(backend.object_count(), 2);
}

#[test]
fn test_retry_after_crashed_overwrite_leaves_no_orphans() {
    let backend = Arc::new(InMemoryBackend::new(4));
    {
        let ctx = GatewayContext::new(config("writer"), backend.clone(), ShutdownSignal::new()).unwrap();
        assert!(put_object(&ctx, PutRequest::new("vault", "doc.txt", vec![1u8; 1500]))
            .unwrap()
            .succeeded());
    }
    let old = live_metadata(&backend, "doc.txt").unwrap();
    crash_during_save(&backend, "doc.txt", vec![2u8; 3000]);
    assert_eq!(backend.object_count(), 3);

    // The retry derives the same replacement id the crashed request created.
    let ctx = GatewayContext::new(config("survivor"), backend.clone(), ShutdownSignal::new()).unwrap();
    let outcome = put_object(&ctx, PutRequest::new("vault", "doc.txt", vec![3u8; 3000])).unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error_message);
    let live = live_metadata(&backend, "doc.txt").unwrap();
    assert_ne!(live.object_id, old.object_id);

    // Everything the crashed request created is still on the ledger.
    let ledger_index = s3gw::config::DEFAULT_LEDGER_INDEX;
    assert_eq!(backend.kv_entries(ledger_index).len(), 3);

    let report = Reaper::new(ctx).run_pass(&HashSet::new()).unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(report.failed, 0);

    assert_eq!(backend.object_ids(), vec![live.object_id]);
    assert_eq!(backend.object_data(live.object_id).unwrap(), vec![3u8; 3000]);
    assert!(backend.kv_entries(ledger_index).is_empty());
}

#[test]
fn test_retry_after_crashed_create_reclaims_colliding_fragment() {
    let backend = Arc::new(InMemoryBackend::new(4));
    crash_during_save(&backend, "new.bin", vec![5u8; 4000]);
    let crashed = backend.object_ids();
    assert_eq!(crashed.len(), 2);

    // Fails the same way, so the retry lands on the crashed primary and fragment ids.
    let ctx = GatewayContext::new(config("survivor"), backend.clone(), ShutdownSignal::new()).unwrap();
    backend.fail_next_writes(1);
    let outcome = put_object(&ctx, PutRequest::new("vault", "new.bin", vec![6u8; 4000])).unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error_message);
    assert_eq!(outcome.fragment_count, 2);

    let live = live_metadata(&backend, "new.bin").unwrap();
    let indexes = BucketIndexes::derive("vault");
    let ext_text = backend.kv_value(indexes.extended, &live.extended_key()).unwrap();
    let ext = ExtendedMetadata::from_json(&ext_text).unwrap();
    let mut referenced: Vec<_> = ext.all_fragments().map(|f| f.object_id).collect();
    referenced.sort();
    assert!(referenced.iter().all(|oid| !crashed.contains(oid)));

    let ledger_index = s3gw::config::DEFAULT_LEDGER_INDEX;
    assert_eq!(backend.kv_entries(ledger_index).len(), 2);
    let report = Reaper::new(ctx).run_pass(&HashSet::new()).unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.failed, 0);

    assert_eq!(backend.object_ids(), referenced);
    assert!(backend.kv_entries(ledger_index).is_empty());
}
