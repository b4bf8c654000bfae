/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use followwatch_core::baseline::BaselineState;
use followwatch_core::channel::{DeliveryOutcome, PostingChannel};
use followwatch_core::cycle::run_check_cycle;
use followwatch_core::delivery_queue::{NotificationQueue, QueueSettings};
use followwatch_core::diff::DiffSettings;
use followwatch_core::monitor_log::CheckStatus;
use followwatch_core::protocol::{ChangeType, DeliveryMessage, Snapshot};
use followwatch_core::provider::SnapshotProvider;
use followwatch_core::runtime::{WatchConfig, WatchService};
use followwatch_core::WatchDb;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Replays scripted snapshots for every handle; repeats the last one when the script runs out.
struct ScriptedProvider {
    script: Mutex<VecDeque<Snapshot>>,
    last: Mutex<Option<Snapshot>>,
}

impl ScriptedProvider {
    fn new(snapshots: Vec<Snapshot>) -> Self {
        Self {
            script: Mutex::new(snapshots.into()),
            last: Mutex::new(None),
        }
    }
}

fn snap(handles: &[&str], expected_total: Option<u64>) -> Snapshot {
    Snapshot {
        handles: handles.iter().map(|h| h.to_string()).collect(),
        expected_total,
    }
}

#[async_trait]
impl SnapshotProvider for ScriptedProvider {
    async fn get_snapshot(&self, _profile_handle: &str) -> Result<Snapshot> {
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(s) = next {
            *last = Some(s);
        }
        (*last)
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no snapshot scripted"))
    }
}

#[derive(Default)]
struct RecordingChannel {
    delivered: Mutex<Vec<DeliveryMessage>>,
}

#[async_trait]
impl PostingChannel for RecordingChannel {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
        self.delivered.lock().unwrap().push(message.clone());
        DeliveryOutcome::Delivered
    }
}

fn open_db(dir: &tempfile::TempDir) -> WatchDb {
    WatchDb::open(dir.path().join("watch.db")).unwrap()
}

#[tokio::test]
async fn baseline_diff_and_delivery_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let profile = db.add_profile("@Watched").unwrap();
    let settings = DiffSettings {
        miss_threshold: 1,
        ..Default::default()
    };
    let provider = ScriptedProvider::new(vec![
        snap(&["A", "B", "C"], Some(3)),
        snap(&["A", "B", "D"], Some(3)),
        snap(&["A", "B", "D"], Some(3)),
    ]);
    let (_tx, shutdown) = watch::channel(false);

    let first = run_check_cycle(&db, &provider, &settings, &shutdown).await.unwrap();
    assert_eq!(first.checks[0].status, CheckStatus::Skipped);
    let p = db.get_profile(profile.id).unwrap().unwrap();
    assert_eq!(p.baseline_state, BaselineState::BaselineComplete);
    let entries = db.list_entries(profile.id).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.miss_count == 0));
    assert!(db.list_unprocessed(24).unwrap().is_empty());

    let second = run_check_cycle(&db, &provider, &settings, &shutdown).await.unwrap();
    assert_eq!(second.checks[0].follows, vec!["d".to_string()]);
    assert!(second.checks[0].unfollows.is_empty());
    let c = db
        .list_entries(profile.id)
        .unwrap()
        .into_iter()
        .find(|e| e.handle == "c")
        .unwrap();
    assert_eq!(c.miss_count, 1);

    let third = run_check_cycle(&db, &provider, &settings, &shutdown).await.unwrap();
    assert!(third.checks[0].follows.is_empty());
    assert_eq!(third.checks[0].unfollows, vec!["c".to_string()]);
    assert!(db.list_entries(profile.id).unwrap().iter().all(|e| e.handle != "c"));

    let queue = NotificationQueue::new(
        db.clone(),
        QueueSettings {
            pacing_delay_secs: 0,
            ..Default::default()
        },
    );
    let channel = RecordingChannel::default();
    let report = queue.run_once(&channel, shutdown.clone()).await.unwrap();
    assert_eq!(report.delivered_groups, 2);

    let delivered = channel.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].profile_handle, "watched");
    assert_eq!(delivered[0].change_type, ChangeType::Follow);
    assert_eq!(delivered[0].targets[0].handle, "d");
    assert_eq!(delivered[1].change_type, ChangeType::Unfollow);
    assert_eq!(delivered[1].text, "@watched unfollowed @c");

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processed, 2);

    // A quiet cycle after delivery records nothing new.
    let quiet = run_check_cycle(&db, &provider, &settings, &shutdown).await.unwrap();
    assert_eq!(quiet.checks[0].status, CheckStatus::NoChange);
    assert!(db.list_unprocessed(24).unwrap().is_empty());
}

#[tokio::test]
async fn partial_snapshots_never_report_before_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let profile = db.add_profile("watched").unwrap();
    let provider = ScriptedProvider::new(vec![
        snap(&["a"], Some(10)),
        snap(&["b", "c"], Some(10)),
        snap(&[], Some(10)),
        snap(&["d", "e", "f", "g", "h", "i", "j", "k", "l"], Some(10)),
    ]);
    let (_tx, shutdown) = watch::channel(false);
    let settings = DiffSettings::default();

    for _ in 0..3 {
        let report = run_check_cycle(&db, &provider, &settings, &shutdown).await.unwrap();
        assert_eq!(report.checks[0].status, CheckStatus::Skipped);
    }
    assert_eq!(
        db.get_profile(profile.id).unwrap().unwrap().baseline_state,
        BaselineState::BuildingBaseline
    );

    run_check_cycle(&db, &provider, &settings, &shutdown).await.unwrap();
    let p = db.get_profile(profile.id).unwrap().unwrap();
    assert_eq!(p.baseline_state, BaselineState::BaselineComplete);
    assert_eq!(db.list_entries(profile.id).unwrap().len(), 12);
    assert!(db.list_events(profile.id, 100).unwrap().is_empty());
}

#[tokio::test]
async fn service_runs_a_check_on_start_and_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let profile = db.add_profile("watched").unwrap();
    let cfg = WatchConfig::default();
    let provider = Arc::new(ScriptedProvider::new(vec![snap(&["a", "b"], Some(2))]));
    let channel = Arc::new(RecordingChannel::default());

    let service = WatchService::start_with(&cfg, db.clone(), provider, channel);
    let logged = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if !db.recent_monitor_log(Some(profile.id), 1).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(logged.is_ok(), "check worker never ran");
    tokio::time::timeout(Duration::from_secs(10), service.stop())
        .await
        .expect("workers should stop on shutdown");

    assert_eq!(
        db.get_profile(profile.id).unwrap().unwrap().baseline_state,
        BaselineState::BaselineComplete
    );
}
