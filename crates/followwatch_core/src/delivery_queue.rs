/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::change_events::{max_age_cutoff_ms, ChangeEvent};
use crate::channel::{DeliveryOutcome, PostingChannel};
use crate::db::{now_ms, WatchDb};
use crate::message::build_message;
use anyhow::{Context, Result};
use followwatch_protocol::{ChangeType, DeliveryMessage, DeliveryTarget};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex as TokioMutex, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct QueueSettings {
    pub max_groups_per_run: u32,
    /// Minimum spacing between two delivery attempts on the posting channel.
    pub pacing_delay_secs: u64,
    /// An event that failed more often than this is dead-lettered.
    pub max_retries: u32,
    /// Pending events older than this are left out of active processing.
    pub max_age_hours: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_groups_per_run: 10,
            pacing_delay_secs: 15 * 60,
            max_retries: 5,
            max_age_hours: 24,
        }
    }
}

/// Pending events sharing (profile, type), delivered as one message.
#[derive(Debug, Clone)]
pub struct DeliveryGroup {
    pub profile_id: i64,
    pub change_type: ChangeType,
    pub events: Vec<ChangeEvent>,
}

impl DeliveryGroup {
    pub fn event_ids(&self) -> Vec<i64> {
        self.events.iter().map(|e| e.id).collect()
    }

    pub fn targets(&self) -> Vec<DeliveryTarget> {
        self.events
            .iter()
            .map(|e| DeliveryTarget {
                handle: e.target.clone(),
                display_name: e.target_display_name.clone(),
            })
            .collect()
    }

    /// Highest attempt count among the group's events.
    pub fn retry_count(&self) -> u32 {
        self.events.iter().map(|e| e.attempts).max().unwrap_or(0)
    }

    fn evidence_ref(&self) -> Option<String> {
        self.events.iter().find_map(|e| e.evidence_ref.clone())
    }
}

/// Groups events by (profile, type), keeping the order in which each group first appears.
pub fn group_events(events: Vec<ChangeEvent>) -> Vec<DeliveryGroup> {
    let mut index: HashMap<(i64, ChangeType), usize> = HashMap::new();
    let mut groups: Vec<DeliveryGroup> = Vec::new();
    for ev in events {
        let key = (ev.profile_id, ev.change_type);
        match index.get(&key) {
            Some(&i) => groups[i].events.push(ev),
            None => {
                index.insert(key, groups.len());
                groups.push(DeliveryGroup {
                    profile_id: ev.profile_id,
                    change_type: ev.change_type,
                    events: vec![ev],
                });
            }
        }
    }
    groups
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRetry {
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct QueueRunReport {
    /// Groups eligible for delivery this run, before the per-run cap.
    pub groups_pending: usize,
    pub delivered_groups: usize,
    pub delivered_events: usize,
    pub transient_failures: usize,
    /// (profile, type) pairs holding events whose retry budget is exhausted.
    pub dead_lettered: usize,
    /// Groups left for a later run (cap reached, fatal stop, or shutdown).
    pub deferred: usize,
    pub fatal_error: Option<String>,
    pub interrupted: bool,
}

/// Exhausted events of one (profile, type) pair.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetter {
    pub profile_id: i64,
    pub profile_handle: String,
    pub change_type: ChangeType,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at_ms: i64,
    /// Exhausted events still within the active age window.
    pub pending_events: u64,
    /// Exhausted events that have since aged out.
    pub stale_events: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub stale: u64,
    pub processed: u64,
    pub failing_groups: u64,
    pub dead_groups: u64,
}

#[derive(Clone)]
pub struct NotificationQueue {
    db: WatchDb,
    settings: QueueSettings,
    notify: Arc<Notify>,
    /// Single posting session: holds the time of the last delivery attempt.
    session: Arc<TokioMutex<Option<Instant>>>,
}

impl NotificationQueue {
    pub fn new(db: WatchDb, settings: QueueSettings) -> Self {
        Self {
            db,
            settings,
            notify: Arc::new(Notify::new()),
            session: Arc::new(TokioMutex::new(None)),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Wakes the worker early, e.g. after a check cycle recorded new events.
    pub fn notify_new_events(&self) {
        self.notify.notify_one();
    }

    pub fn start_worker(
        &self,
        shutdown: watch::Receiver<bool>,
        channel: Arc<dyn PostingChannel>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_loop(shutdown, channel, interval).await {
                warn!("notification worker stopped: {e:#}");
            }
        })
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        channel: Arc<dyn PostingChannel>,
        interval: Duration,
    ) -> Result<()> {
        info!("notification queue db: {}", self.db.path().display());
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_once(channel.as_ref(), shutdown.clone()).await {
                Ok(report) => {
                    if report.delivered_groups > 0 || report.fatal_error.is_some() {
                        info!(
                            delivered = report.delivered_groups,
                            events = report.delivered_events,
                            transient = report.transient_failures,
                            deferred = report.deferred,
                            dead = report.dead_lettered,
                            "notification run finished"
                        );
                    }
                }
                Err(e) => warn!("notification run error: {e:#}"),
            }
        }
        Ok(())
    }

    /// One processing pass over the pending backlog. Groups are delivered strictly one after
    /// another; a fatal channel failure ends the pass and leaves later groups untouched.
    /// Exhausted events are held back, so later events of the same pair still go out.
    pub async fn run_once(
        &self,
        channel: &dyn PostingChannel,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<QueueRunReport> {
        let settings = self.settings;
        let mut report = QueueRunReport::default();

        let events = tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || db.list_unprocessed(settings.max_age_hours)
        })
        .await??;
        if events.is_empty() {
            return Ok(report);
        }

        let mut dead: HashSet<(i64, ChangeType)> = HashSet::new();
        let mut live = Vec::with_capacity(events.len());
        for ev in events {
            if ev.attempts > settings.max_retries {
                dead.insert((ev.profile_id, ev.change_type));
            } else {
                live.push(ev);
            }
        }
        report.dead_lettered = dead.len();

        let mut eligible = group_events(live);
        report.groups_pending = eligible.len();

        let cap = settings.max_groups_per_run.max(1) as usize;
        if eligible.len() > cap {
            report.deferred = eligible.len() - cap;
            eligible.truncate(cap);
        }

        let total = eligible.len();
        let mut handles: HashMap<i64, String> = HashMap::new();
        for (idx, group) in eligible.into_iter().enumerate() {
            let remaining = total - idx - 1;
            if *shutdown.borrow() {
                report.interrupted = true;
                report.deferred += remaining + 1;
                break;
            }

            let profile_handle = match handles.get(&group.profile_id) {
                Some(h) => h.clone(),
                None => {
                    let h = self.profile_handle(group.profile_id).await?;
                    handles.insert(group.profile_id, h.clone());
                    h
                }
            };
            let message = build_message(
                &profile_handle,
                group.change_type,
                group.targets(),
                group.evidence_ref(),
            );

            let Some(outcome) = self.paced_deliver(channel, &message, &mut shutdown).await else {
                report.interrupted = true;
                report.deferred += remaining + 1;
                break;
            };

            match outcome {
                DeliveryOutcome::Delivered => {
                    let ids = group.event_ids();
                    let marked = tokio::task::spawn_blocking({
                        let db = self.db.clone();
                        let ids = ids.clone();
                        move || db.mark_processed(&ids)
                    })
                    .await?
                    .with_context(|| {
                        format!("mark group delivered: profile={} type={}", group.profile_id, group.change_type)
                    })?;
                    report.delivered_groups += 1;
                    report.delivered_events += ids.len();
                    info!(
                        profile = %profile_handle,
                        change_type = %group.change_type,
                        targets = ids.len(),
                        marked,
                        "group delivered"
                    );
                }
                DeliveryOutcome::Transient(err) => {
                    let count = self.record_failure(&group, &err).await?;
                    report.transient_failures += 1;
                    if count > settings.max_retries {
                        warn!(
                            profile = %profile_handle,
                            change_type = %group.change_type,
                            retries = count,
                            "group dead-lettered: {err}"
                        );
                    } else {
                        warn!(
                            profile = %profile_handle,
                            change_type = %group.change_type,
                            retries = count,
                            "transient delivery failure: {err}"
                        );
                    }
                }
                DeliveryOutcome::Fatal(err) => {
                    let count = self.record_failure(&group, &err).await?;
                    error!(
                        profile = %profile_handle,
                        change_type = %group.change_type,
                        retries = count,
                        skipped = remaining,
                        "posting channel unusable, stopping run: {err}"
                    );
                    report.fatal_error = Some(err);
                    report.deferred += remaining;
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Takes the posting session, waits out the pacing delay since the previous attempt and
    /// delivers. Returns `None` when shutdown arrives during the wait.
    async fn paced_deliver(
        &self,
        channel: &dyn PostingChannel,
        message: &DeliveryMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<DeliveryOutcome> {
        let mut last_attempt = self.session.lock().await;
        if let Some(prev) = *last_attempt {
            let ready_at = prev + Duration::from_secs(self.settings.pacing_delay_secs);
            if ready_at > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(ready_at) => {}
                    _ = wait_for_shutdown(shutdown) => return None,
                }
            }
        }
        if *shutdown.borrow() {
            return None;
        }
        let outcome = channel.deliver(message).await;
        *last_attempt = Some(Instant::now());
        Some(outcome)
    }

    async fn profile_handle(&self, profile_id: i64) -> Result<String> {
        let profile = tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || db.get_profile(profile_id)
        })
        .await??;
        Ok(profile
            .map(|p| p.handle)
            .unwrap_or_else(|| format!("profile-{profile_id}")))
    }

    async fn record_failure(&self, group: &DeliveryGroup, err: &str) -> Result<u32> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            let err = err.to_string();
            let ids = group.event_ids();
            move || -> Result<u32> {
                let mut conn = db.connect()?;
                record_group_failure(&mut conn, &ids, &err, now_ms())
            }
        })
        .await?
    }

    /// Retry state of the pair's active pending events, if any of them has failed.
    pub async fn group_retry(&self, profile_id: i64, change_type: ChangeType) -> Result<Option<GroupRetry>> {
        let max_age_hours = self.settings.max_age_hours;
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<Option<GroupRetry>> {
                let conn = db.connect()?;
                let cutoff = max_age_cutoff_ms(now_ms(), max_age_hours);
                Ok(conn
                    .query_row(
                        r#"
                        SELECT attempts, last_error, last_attempt_at_ms FROM change_events
                        WHERE profile_id = ?1 AND change_type = ?2 AND processed = 0
                          AND attempts > 0 AND detected_at_ms >= ?3
                        ORDER BY attempts DESC, last_attempt_at_ms DESC, id DESC
                        LIMIT 1
                        "#,
                        params![profile_id, change_type.as_str(), cutoff],
                        |r| {
                            Ok(GroupRetry {
                                retry_count: r.get(0)?,
                                last_error: r.get(1)?,
                                last_attempt_at_ms: r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                            })
                        },
                    )
                    .optional()?)
            }
        })
        .await?
    }

    /// Operator action: clears the retry state of the pair's pending events so the next run
    /// attempts them again.
    pub async fn requeue_group(&self, profile_id: i64, change_type: ChangeType) -> Result<bool> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<bool> {
                let conn = db.connect()?;
                let reset = conn.execute(
                    r#"
                    UPDATE change_events SET attempts = 0, last_error = NULL, last_attempt_at_ms = NULL
                    WHERE profile_id = ?1 AND change_type = ?2 AND processed = 0 AND attempts > 0
                    "#,
                    params![profile_id, change_type.as_str()],
                )?;
                Ok(reset > 0)
            }
        })
        .await?
    }

    /// Pairs with exhausted events inside the active age window. Once all of a pair's
    /// exhausted events age out it is no longer listed.
    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let settings = self.settings;
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<Vec<DeadLetter>> {
                let conn = db.connect()?;
                let cutoff = max_age_cutoff_ms(now_ms(), settings.max_age_hours);
                let mut stmt = conn.prepare(
                    r#"
                    SELECT e.profile_id, COALESCE(p.handle, ''), e.change_type, MAX(e.attempts),
                           MAX(e.last_attempt_at_ms), COUNT(*),
                           (SELECT COUNT(*) FROM change_events s
                            WHERE s.profile_id = e.profile_id AND s.change_type = e.change_type
                              AND s.processed = 0 AND s.attempts > ?1 AND s.detected_at_ms < ?2),
                           (SELECT l.last_error FROM change_events l
                            WHERE l.profile_id = e.profile_id AND l.change_type = e.change_type
                              AND l.processed = 0 AND l.attempts > ?1 AND l.detected_at_ms >= ?2
                            ORDER BY l.last_attempt_at_ms DESC, l.id DESC LIMIT 1)
                    FROM change_events e
                    LEFT JOIN monitored_profiles p ON p.id = e.profile_id
                    WHERE e.processed = 0 AND e.attempts > ?1 AND e.detected_at_ms >= ?2
                    GROUP BY e.profile_id, e.change_type
                    ORDER BY MAX(e.last_attempt_at_ms) DESC
                    "#,
                )?;
                let mut rows = stmt.query(params![settings.max_retries, cutoff])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let kind: String = row.get(2)?;
                    let Some(change_type) = ChangeType::from_str(&kind) else {
                        continue;
                    };
                    out.push(DeadLetter {
                        profile_id: row.get(0)?,
                        profile_handle: row.get(1)?,
                        change_type,
                        retry_count: row.get(3)?,
                        last_attempt_at_ms: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                        pending_events: row.get(5)?,
                        stale_events: row.get(6)?,
                        last_error: row.get(7)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let settings = self.settings;
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<QueueStats> {
                let conn = db.connect()?;
                let cutoff = max_age_cutoff_ms(now_ms(), settings.max_age_hours);
                let pending: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM change_events WHERE processed = 0 AND detected_at_ms >= ?1",
                    params![cutoff],
                    |r| r.get(0),
                )?;
                let stale: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM change_events WHERE processed = 0 AND detected_at_ms < ?1",
                    params![cutoff],
                    |r| r.get(0),
                )?;
                let processed: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM change_events WHERE processed = 1",
                    [],
                    |r| r.get(0),
                )?;
                let failing_groups = count_pairs(&conn, cutoff, "attempts > 0 AND attempts <= ?2", settings.max_retries)?;
                let dead_groups = count_pairs(&conn, cutoff, "attempts > ?2", settings.max_retries)?;
                Ok(QueueStats {
                    pending,
                    stale,
                    processed,
                    failing_groups,
                    dead_groups,
                })
            }
        })
        .await?
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: shutdown can no longer be requested.
            std::future::pending::<()>().await;
        }
    }
}

/// Distinct (profile, type) pairs among active pending events matching `attempts_filter`.
fn count_pairs(conn: &Connection, cutoff: i64, attempts_filter: &str, max_retries: u32) -> Result<u64> {
    Ok(conn.query_row(
        &format!(
            r#"
            SELECT COUNT(*) FROM (
              SELECT DISTINCT profile_id, change_type FROM change_events
              WHERE processed = 0 AND detected_at_ms >= ?1 AND {attempts_filter}
            )
            "#
        ),
        params![cutoff, max_retries],
        |r| r.get(0),
    )?)
}

/// Charges one failed attempt to every event of the group. Returns the group's new retry count.
fn record_group_failure(conn: &mut Connection, ids: &[i64], err: &str, now: i64) -> Result<u32> {
    let err: String = err.chars().take(1000).collect();
    let tx = conn.transaction()?;
    let mut worst = 0;
    {
        let mut stmt = tx.prepare(
            r#"
            UPDATE change_events
            SET attempts = attempts + 1, last_error = ?2, last_attempt_at_ms = ?3
            WHERE id = ?1 AND processed = 0
            RETURNING attempts
            "#,
        )?;
        for id in ids {
            let attempts: Option<u32> = stmt
                .query_row(params![id, err, now], |r| r.get(0))
                .optional()?;
            worst = worst.max(attempts.unwrap_or(0));
        }
    }
    tx.commit()?;
    Ok(worst)
}
