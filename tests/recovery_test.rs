//! Integration tests for restart recovery of the aggregation-and-sync
//! pipeline: a teardown mid-session must leave every unsynced day in the
//! durable store, and the next run must find and flush them, oldest first.

use chrono::{TimeZone, Utc};
use posture_agent::{
    core::{AngleComputer, LocalAggregator, SyncState},
    remote::{RemoteError, UpsertResponse},
    source::{Landmark, LandmarkFrame},
    store::LocalStore,
    sync::{RetryPolicy, SyncScheduler},
};
use std::path::PathBuf;
use std::time::Instant;

fn test_data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("posture-agent-it-{name}"));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn frame(offset_ms: i64) -> LandmarkFrame {
    // Slight forward lean so deviation is non-zero.
    LandmarkFrame::new(
        Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap()
            + chrono::Duration::milliseconds(offset_ms),
        Landmark::new(0.4, 0.6),
        Landmark::new(0.6, 0.6),
        Landmark::new(0.45, 0.4),
        Landmark::new(0.65, 0.4),
    )
}

fn ack(date: &str) -> UpsertResponse {
    UpsertResponse {
        date: date.to_string(),
        updated_at: None,
    }
}

#[test]
fn test_pipeline_survives_restart_with_two_unsynced_days() {
    let data_dir = test_data_dir("two-days");

    // First process lifetime: measure across a midnight rollover, then
    // tear down without any network.
    {
        let store = LocalStore::open(&data_dir).unwrap();
        let mut angles = AngleComputer::new(15.0, 0.0, 0.5, 5.0, 0.5);
        let mut aggregator = LocalAggregator::new("u1", chrono_tz::UTC);

        // Day one: a run of frames half a second apart.
        for i in 0..10 {
            let sample = angles.process(&frame(i * 500)).unwrap();
            aggregator.fold(&sample);
        }
        // Day two: frames after local midnight.
        for i in 0..5 {
            let sample = angles
                .process(&frame(16 * 3600 * 1000 + i * 500))
                .unwrap();
            aggregator.fold(&sample);
        }

        // Teardown drain: seal handoff plus the live snapshot.
        for sealed in aggregator.take_sealed() {
            store.put(&sealed).unwrap();
        }
        store.put(&aggregator.snapshot().unwrap()).unwrap();
    }

    // Second process lifetime: recovery finds exactly those two days.
    {
        let store = LocalStore::open(&data_dir).unwrap();
        store.recover("u1").unwrap();

        let pending = store.list_pending("u1").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].date_iso(), "2024-03-05");
        assert_eq!(pending[1].date_iso(), "2024-03-06");
        assert_eq!(pending[0].count, 10);
        assert_eq!(pending[1].count, 5);
        assert!(pending.iter().all(|a| a.invariants_hold()));

        // The scheduler flushes both, oldest date first.
        let mut sent = Vec::new();
        let mut scheduler = SyncScheduler::new("u1", RetryPolicy::default());
        let report = scheduler.run_flush_pass(&store, &[], Instant::now(), |a| {
            sent.push(a.date_iso());
            Ok(ack(&a.date_iso()))
        });

        assert_eq!(sent, vec!["2024-03-05", "2024-03-06"]);
        assert_eq!(report.synced.len(), 2);
        assert!(store.list_pending("u1").unwrap().is_empty());
    }
}

#[test]
fn test_interrupted_flush_is_retried_after_restart() {
    let data_dir = test_data_dir("interrupted-flush");

    // A flush was in flight when the process died: the day is persisted as
    // Syncing and no acknowledgement was recorded.
    {
        let store = LocalStore::open(&data_dir).unwrap();
        let mut angles = AngleComputer::new(15.0, 0.0, 0.5, 5.0, 0.5);
        let mut aggregator = LocalAggregator::new("u1", chrono_tz::UTC);
        for i in 0..4 {
            let sample = angles.process(&frame(i * 500)).unwrap();
            aggregator.fold(&sample);
        }
        let mut snapshot = aggregator.snapshot().unwrap();
        snapshot.sync_state = SyncState::Syncing;
        store.put(&snapshot).unwrap();
    }

    // Restart: the stuck day is demoted to Failed and re-sent.
    {
        let store = LocalStore::open(&data_dir).unwrap();
        let demoted = store.recover("u1").unwrap();
        assert_eq!(demoted.len(), 1);

        let mut scheduler = SyncScheduler::new("u1", RetryPolicy::default());
        let report =
            scheduler.run_flush_pass(&store, &[], Instant::now(), |a| Ok(ack(&a.date_iso())));
        assert_eq!(report.synced.len(), 1);

        let stored = store.get("u1", demoted[0]).unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::Synced);
    }
}

#[test]
fn test_offline_session_keeps_days_pending_without_losing_samples() {
    let data_dir = test_data_dir("offline");
    let store = LocalStore::open(&data_dir).unwrap();

    let mut angles = AngleComputer::new(15.0, 0.0, 0.5, 5.0, 0.5);
    let mut aggregator = LocalAggregator::new("u1", chrono_tz::UTC);
    for i in 0..6 {
        let sample = angles.process(&frame(i * 500)).unwrap();
        aggregator.fold(&sample);
    }
    store.put(&aggregator.snapshot().unwrap()).unwrap();

    // Every flush attempt fails; the day must stay in the retry pool with
    // its contents intact.
    let mut scheduler = SyncScheduler::new("u1", RetryPolicy::default());
    let report = scheduler.run_flush_pass(&store, &[], Instant::now(), |_| {
        Err(RemoteError::Network("offline".into()))
    });
    assert_eq!(report.synced.len(), 0);
    assert_eq!(report.failed.len(), 1);

    let pending = store.list_pending("u1").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].count, 6);
    assert_eq!(pending[0].sync_state, SyncState::Failed);
}
