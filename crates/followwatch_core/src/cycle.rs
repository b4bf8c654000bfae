/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::baseline::{BaselineState, MonitoredProfile};
use crate::db::{now_ms, WatchDb};
use crate::delivery_queue::NotificationQueue;
use crate::diff::{DiffOutcome, DiffSettings};
use crate::monitor_log::{CheckStatus, MonitorLogEntry};
use crate::provider::SnapshotProvider;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileCheck {
    pub profile_id: i64,
    pub handle: String,
    pub status: CheckStatus,
    pub follows: Vec<String>,
    pub unfollows: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CycleReport {
    pub checks: Vec<ProfileCheck>,
    /// Shutdown arrived before every profile was checked.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn events_recorded(&self) -> usize {
        self.checks
            .iter()
            .map(|c| c.follows.len() + c.unfollows.len())
            .sum()
    }

    pub fn failures(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| matches!(c.status, CheckStatus::Failed | CheckStatus::Error))
            .count()
    }
}

pub fn check_status(outcome: &DiffOutcome, settings: &DiffSettings) -> CheckStatus {
    if outcome.state_before != Some(BaselineState::BaselineComplete) {
        return CheckStatus::Skipped;
    }
    if outcome.event_count() == 0 {
        return CheckStatus::NoChange;
    }
    let covered = outcome
        .coverage
        .map(|c| c >= settings.completeness_ratio)
        .unwrap_or(settings.assume_complete_when_total_unknown);
    if covered {
        CheckStatus::Success
    } else {
        CheckStatus::Partial
    }
}

/// Checks every active profile once, one at a time. Per-profile failures are logged and
/// recorded in the monitoring log; only failing to list profiles aborts the cycle.
pub async fn run_check_cycle(
    db: &WatchDb,
    provider: &dyn SnapshotProvider,
    settings: &DiffSettings,
    shutdown: &watch::Receiver<bool>,
) -> Result<CycleReport> {
    let profiles = tokio::task::spawn_blocking({
        let db = db.clone();
        move || db.list_profiles(true)
    })
    .await??;

    let mut report = CycleReport::default();
    for profile in profiles {
        if *shutdown.borrow() {
            report.interrupted = true;
            break;
        }
        report
            .checks
            .push(check_profile(db, provider, settings, &profile).await);
    }
    Ok(report)
}

async fn check_profile(
    db: &WatchDb,
    provider: &dyn SnapshotProvider,
    settings: &DiffSettings,
    profile: &MonitoredProfile,
) -> ProfileCheck {
    let started = Instant::now();
    let mut check = ProfileCheck {
        profile_id: profile.id,
        handle: profile.handle.clone(),
        status: CheckStatus::Failed,
        follows: Vec::new(),
        unfollows: Vec::new(),
        error: None,
    };

    let entry = match provider.get_snapshot(&profile.handle).await {
        Err(e) => {
            warn!(profile = %profile.handle, "snapshot fetch failed: {e:#}");
            check.error = Some(format!("{e:#}"));
            MonitorLogEntry {
                profile_id: profile.id,
                status: CheckStatus::Failed,
                live_count: profile.last_following_count,
                stored_count: stored_count(db, profile).await,
                scraped_count: 0,
                coverage: None,
                new_follows: 0,
                new_unfollows: 0,
                error: check.error.clone(),
                duration_ms: 0,
            }
        }
        Ok(snapshot) => {
            let live_count = snapshot.expected_total.map(|v| v as i64);
            let scraped = snapshot.handles.len() as i64;
            let applied = tokio::task::spawn_blocking({
                let db = db.clone();
                let id = profile.id;
                let settings = *settings;
                move || db.apply_snapshot(id, &snapshot, &settings)
            })
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

            match applied {
                Ok(outcome) => {
                    check.status = check_status(&outcome, settings);
                    if outcome.baseline_established() {
                        info!(
                            profile = %profile.handle,
                            stored = outcome.stored_count,
                            "baseline established"
                        );
                    }
                    if outcome.event_count() > 0 {
                        info!(
                            profile = %profile.handle,
                            follows = outcome.follows.len(),
                            unfollows = outcome.unfollows.len(),
                            coverage = outcome.coverage.unwrap_or(-1.0),
                            "changes detected"
                        );
                    }
                    let entry = MonitorLogEntry {
                        profile_id: profile.id,
                        status: check.status,
                        live_count,
                        stored_count: outcome.stored_count as i64,
                        scraped_count: outcome.scraped_count as i64,
                        coverage: outcome.coverage,
                        new_follows: outcome.follows.len() as i64,
                        new_unfollows: outcome.unfollows.len() as i64,
                        error: None,
                        duration_ms: 0,
                    };
                    check.follows = outcome.follows;
                    check.unfollows = outcome.unfollows;
                    entry
                }
                Err(e) => {
                    warn!(profile = %profile.handle, "diff failed: {e:#}");
                    check.status = CheckStatus::Error;
                    check.error = Some(format!("{e:#}"));
                    MonitorLogEntry {
                        profile_id: profile.id,
                        status: CheckStatus::Error,
                        live_count,
                        stored_count: stored_count(db, profile).await,
                        scraped_count: scraped,
                        coverage: None,
                        new_follows: 0,
                        new_unfollows: 0,
                        error: check.error.clone(),
                        duration_ms: 0,
                    }
                }
            }
        }
    };

    let entry = MonitorLogEntry {
        duration_ms: started.elapsed().as_millis() as i64,
        ..entry
    };
    let logged = tokio::task::spawn_blocking({
        let db = db.clone();
        move || db.append_monitor_log(&entry)
    })
    .await
    .map_err(anyhow::Error::from)
    .and_then(|r| r);
    if let Err(e) = logged {
        warn!(profile = %profile.handle, "monitor log write failed: {e:#}");
    }
    check
}

#[derive(Debug, Clone, Copy)]
pub struct CheckWorkerConfig {
    pub interval: Duration,
    pub diff: DiffSettings,
    pub log_retention_days: u32,
}

/// Periodic check cycles. Cycles that record events wake the notification queue; the
/// monitoring log is pruned after each cycle.
pub fn start_check_worker(
    cfg: CheckWorkerConfig,
    db: WatchDb,
    provider: Arc<dyn SnapshotProvider>,
    queue: NotificationQueue,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(cfg.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            match run_check_cycle(&db, provider.as_ref(), &cfg.diff, &shutdown).await {
                Ok(report) => {
                    let events = report.events_recorded();
                    info!(
                        profiles = report.checks.len(),
                        failures = report.failures(),
                        events,
                        "check cycle finished"
                    );
                    if events > 0 {
                        queue.notify_new_events();
                    }
                }
                Err(e) => warn!("check cycle error: {e:#}"),
            }

            let cutoff = now_ms()
                .saturating_sub((cfg.log_retention_days as i64).saturating_mul(24 * 3600 * 1000));
            let pruned = tokio::task::spawn_blocking({
                let db = db.clone();
                move || db.prune_monitor_log_before(cutoff)
            })
            .await;
            match pruned {
                Ok(Ok(deleted)) if deleted > 0 => info!(deleted, "pruned monitor_log"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("monitor log prune error: {e:#}"),
                Err(e) => warn!("monitor log prune task failed: {e}"),
            }
        }
    })
}

/// Stored entry count for a log row. When the store cannot answer, the count recorded with
/// the baseline stands in.
async fn stored_count(db: &WatchDb, profile: &MonitoredProfile) -> i64 {
    let counted = tokio::task::spawn_blocking({
        let db = db.clone();
        let id = profile.id;
        move || db.entry_count(id)
    })
    .await
    .map_err(anyhow::Error::from)
    .and_then(|r| r);
    match counted {
        Ok(n) => n as i64,
        Err(e) => {
            warn!(profile = %profile.handle, "entry count unavailable: {e:#}");
            profile.baseline_following_count.unwrap_or(0)
        }
    }
}
