/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Miss-tolerant comparison of following-list snapshots against the stored baseline.
//!
//! Until a profile's baseline is complete, snapshots are only merged into it and nothing is
//! reported. Afterwards new handles are reported immediately, while missing handles have to stay
//! absent for more than `miss_threshold` consecutive snapshots before they count as unfollowed.

use crate::baseline::{self, normalize_handles, BaselineState};
use crate::change_events::{insert_event, NewChangeEvent};
use crate::db::{now_ms, WatchDb};
use anyhow::{Context, Result};
use followwatch_protocol::{ChangeType, Snapshot};
use rusqlite::TransactionBehavior;
use std::collections::HashSet;

#[derive(Clone, Copy, Debug)]
pub struct DiffSettings {
    /// Consecutive misses tolerated before an entry is dropped and reported.
    pub miss_threshold: u32,
    /// Minimum retrieved/expected ratio that completes a baseline.
    pub completeness_ratio: f64,
    /// Treat non-empty snapshots without a reported total as complete.
    pub assume_complete_when_total_unknown: bool,
}

impl Default for DiffSettings {
    fn default() -> Self {
        Self {
            miss_threshold: 2,
            completeness_ratio: 0.9,
            assume_complete_when_total_unknown: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub state_before: Option<BaselineState>,
    pub state_after: Option<BaselineState>,
    /// Handles whose FOLLOW event was written this cycle.
    pub follows: Vec<String>,
    /// Handles whose entry was dropped and UNFOLLOW event written this cycle.
    pub unfollows: Vec<String>,
    pub scraped_count: u64,
    pub expected_total: Option<u64>,
    pub coverage: Option<f64>,
    /// Entries stored for the profile after the cycle.
    pub stored_count: u64,
}

impl DiffOutcome {
    pub fn event_count(&self) -> usize {
        self.follows.len() + self.unfollows.len()
    }

    pub fn baseline_established(&self) -> bool {
        self.state_before != Some(BaselineState::BaselineComplete)
            && self.state_after == Some(BaselineState::BaselineComplete)
    }
}

/// Retrieved/expected ratio. An expected total of zero counts as fully covered.
pub fn coverage_ratio(scraped: u64, expected_total: Option<u64>) -> Option<f64> {
    match expected_total {
        None => None,
        Some(0) => Some(1.0),
        Some(n) => Some(scraped as f64 / n as f64),
    }
}

fn is_complete_enough(scraped: u64, coverage: Option<f64>, settings: &DiffSettings) -> bool {
    match coverage {
        Some(c) => c >= settings.completeness_ratio,
        None => settings.assume_complete_when_total_unknown && scraped > 0,
    }
}

impl WatchDb {
    /// Applies one snapshot to a profile's baseline inside a single write transaction and
    /// returns what changed. Snapshot content never causes an error; only store failures and
    /// unknown profiles do.
    pub fn apply_snapshot(
        &self,
        profile_id: i64,
        snapshot: &Snapshot,
        settings: &DiffSettings,
    ) -> Result<DiffOutcome> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let profile = baseline::load_profile(&tx, profile_id)?
            .with_context(|| format!("unknown profile id {profile_id}"))?;

        let handles = normalize_handles(&snapshot.handles);
        let scraped = handles.len() as u64;
        let coverage = coverage_ratio(scraped, snapshot.expected_total);
        let observed = snapshot.expected_total.map(|v| v as i64);
        let now = now_ms();

        let mut out = DiffOutcome {
            state_before: Some(profile.baseline_state),
            scraped_count: scraped,
            expected_total: snapshot.expected_total,
            coverage,
            ..Default::default()
        };

        let state_after = match profile.baseline_state {
            BaselineState::Uninitialized | BaselineState::BuildingBaseline => {
                for (pos, handle) in handles.iter().enumerate() {
                    baseline::merge_entry(&tx, profile_id, handle, pos as i64, now)?;
                }
                if is_complete_enough(scraped, coverage, settings) {
                    let stored = baseline::count_entries(&tx, profile_id)? as i64;
                    baseline::set_baseline_state(
                        &tx,
                        profile_id,
                        BaselineState::BaselineComplete,
                        Some(observed.unwrap_or(stored)),
                        now,
                    )?;
                    BaselineState::BaselineComplete
                } else {
                    baseline::set_baseline_state(
                        &tx,
                        profile_id,
                        BaselineState::BuildingBaseline,
                        None,
                        now,
                    )?;
                    BaselineState::BuildingBaseline
                }
            }
            BaselineState::BaselineComplete => {
                let stored = baseline::load_entry_misses(&tx, profile_id)?;
                let mut present = HashSet::with_capacity(handles.len());

                for (pos, handle) in handles.iter().enumerate() {
                    present.insert(handle.as_str());
                    if stored.contains_key(handle) {
                        baseline::confirm_entry(&tx, profile_id, handle, pos as i64, now)?;
                        continue;
                    }
                    if baseline::insert_entry(&tx, profile_id, handle, pos as i64, now)? {
                        let ev = NewChangeEvent::new(profile_id, ChangeType::Follow, handle);
                        if insert_event(&tx, &ev, now)?.is_some() {
                            out.follows.push(handle.clone());
                        }
                    }
                }

                let mut missing = stored
                    .keys()
                    .filter(|h| !present.contains(h.as_str()))
                    .cloned()
                    .collect::<Vec<_>>();
                missing.sort();
                for handle in missing {
                    let Some(misses) = baseline::bump_miss(&tx, profile_id, &handle)? else {
                        continue;
                    };
                    if misses <= settings.miss_threshold {
                        continue;
                    }
                    if baseline::delete_entry(&tx, profile_id, &handle)? {
                        let ev = NewChangeEvent::new(profile_id, ChangeType::Unfollow, &handle);
                        if insert_event(&tx, &ev, now)?.is_some() {
                            out.unfollows.push(handle);
                        }
                    }
                }
                BaselineState::BaselineComplete
            }
        };

        baseline::record_check(&tx, profile_id, observed, now)?;
        out.stored_count = baseline::count_entries(&tx, profile_id)?;
        out.state_after = Some(state_after);
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn snap(handles: &[&str], expected: Option<u64>) -> Snapshot {
        Snapshot::new(handles.iter().map(|h| h.to_string()).collect(), expected)
    }

    fn settings(miss_threshold: u32) -> DiffSettings {
        DiffSettings {
            miss_threshold,
            ..Default::default()
        }
    }

    #[test]
    fn coverage_handles_unknown_and_zero_totals() {
        assert_eq!(coverage_ratio(5, None), None);
        assert_eq!(coverage_ratio(0, Some(0)), Some(1.0));
        assert_eq!(coverage_ratio(9, Some(10)), Some(0.9));
    }

    #[test]
    fn complete_first_snapshot_establishes_baseline_without_events() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let out = db
            .apply_snapshot(p.id, &snap(&["A", "B", "C"], Some(3)), &settings(1))
            .unwrap();
        assert_eq!(out.event_count(), 0);
        assert!(out.baseline_established());
        assert_eq!(out.stored_count, 3);

        let p = db.get_profile(p.id).unwrap().unwrap();
        assert_eq!(p.baseline_state, BaselineState::BaselineComplete);
        assert_eq!(p.baseline_following_count, Some(3));
        assert_eq!(p.last_following_count, Some(3));
        assert!(p.baseline_at_ms.is_some());
        assert!(p.last_check_at_ms.is_some());
        let entries = db.list_entries(p.id).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.miss_count == 0));
        assert!(db.list_unprocessed(24).unwrap().is_empty());
    }

    #[test]
    fn building_baseline_merges_without_events() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let s = settings(2);

        let out = db.apply_snapshot(p.id, &snap(&["a", "b"], Some(10)), &s).unwrap();
        assert_eq!(out.state_after, Some(BaselineState::BuildingBaseline));
        let out = db.apply_snapshot(p.id, &snap(&["c"], Some(10)), &s).unwrap();
        assert_eq!(out.state_after, Some(BaselineState::BuildingBaseline));
        let out = db.apply_snapshot(p.id, &snap(&[], Some(10)), &s).unwrap();
        assert_eq!(out.event_count(), 0);

        let entries = db.list_entries(p.id).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.miss_count == 0));
        assert!(db.list_unprocessed(24).unwrap().is_empty());

        let full: Vec<String> = (0..9).map(|i| format!("h{i}")).collect();
        let out = db
            .apply_snapshot(p.id, &Snapshot::new(full, Some(10)), &s)
            .unwrap();
        assert!(out.baseline_established());
        assert_eq!(out.event_count(), 0);
        assert_eq!(out.stored_count, 12);
        assert!(db.list_unprocessed(24).unwrap().is_empty());
    }

    #[test]
    fn unknown_total_only_completes_when_configured() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let out = db
            .apply_snapshot(p.id, &snap(&["a"], None), &DiffSettings::default())
            .unwrap();
        assert_eq!(out.state_after, Some(BaselineState::BuildingBaseline));

        let lenient = DiffSettings {
            assume_complete_when_total_unknown: true,
            ..Default::default()
        };
        let out = db.apply_snapshot(p.id, &snap(&[], None), &lenient).unwrap();
        assert_eq!(out.state_after, Some(BaselineState::BuildingBaseline));
        let out = db.apply_snapshot(p.id, &snap(&["a"], None), &lenient).unwrap();
        assert_eq!(out.state_after, Some(BaselineState::BaselineComplete));
        assert_eq!(
            db.get_profile(p.id).unwrap().unwrap().baseline_following_count,
            Some(1)
        );
    }

    #[test]
    fn follow_then_unfollow_after_threshold() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let s = settings(1);
        db.apply_snapshot(p.id, &snap(&["A", "B", "C"], Some(3)), &s).unwrap();

        let out = db.apply_snapshot(p.id, &snap(&["A", "B", "D"], Some(3)), &s).unwrap();
        assert_eq!(out.follows, vec!["d"]);
        assert!(out.unfollows.is_empty());
        let c = db
            .list_entries(p.id)
            .unwrap()
            .into_iter()
            .find(|e| e.handle == "c")
            .unwrap();
        assert_eq!(c.miss_count, 1);

        let out = db.apply_snapshot(p.id, &snap(&["A", "B", "D"], Some(3)), &s).unwrap();
        assert!(out.follows.is_empty());
        assert_eq!(out.unfollows, vec!["c"]);
        assert!(db.list_entries(p.id).unwrap().iter().all(|e| e.handle != "c"));

        let pending = db.list_unprocessed(24).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending
                .iter()
                .filter(|e| e.change_type == ChangeType::Unfollow && e.target == "c")
                .count(),
            1
        );
    }

    #[test]
    fn misses_up_to_threshold_never_report() {
        for t in 0..4u32 {
            let (_dir, db) = test_db();
            let p = db.add_profile("watched").unwrap();
            let s = settings(t);
            db.apply_snapshot(p.id, &snap(&["keep", "gone"], Some(2)), &s).unwrap();
            for _ in 0..t {
                let out = db.apply_snapshot(p.id, &snap(&["keep"], Some(2)), &s).unwrap();
                assert!(out.unfollows.is_empty(), "threshold {t}");
            }
            assert_eq!(db.list_entries(p.id).unwrap().len(), 2);
            let out = db.apply_snapshot(p.id, &snap(&["keep"], Some(2)), &s).unwrap();
            assert_eq!(out.unfollows, vec!["gone"], "threshold {t}");
            let out = db.apply_snapshot(p.id, &snap(&["keep"], Some(2)), &s).unwrap();
            assert!(out.unfollows.is_empty());
        }
    }

    #[test]
    fn reappearing_handle_resets_misses() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let s = settings(2);
        db.apply_snapshot(p.id, &snap(&["a", "b"], Some(2)), &s).unwrap();
        db.apply_snapshot(p.id, &snap(&["a"], Some(2)), &s).unwrap();
        db.apply_snapshot(p.id, &snap(&["a"], Some(2)), &s).unwrap();
        db.apply_snapshot(p.id, &snap(&["a", "b"], Some(2)), &s).unwrap();
        assert!(db.list_entries(p.id).unwrap().iter().all(|e| e.miss_count == 0));
        db.apply_snapshot(p.id, &snap(&["a"], Some(2)), &s).unwrap();
        db.apply_snapshot(p.id, &snap(&["a"], Some(2)), &s).unwrap();
        assert!(db.list_unprocessed(24).unwrap().is_empty());
    }

    #[test]
    fn identical_snapshot_replay_is_quiet() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let s = settings(2);
        db.apply_snapshot(p.id, &snap(&["a", "b"], Some(2)), &s).unwrap();
        let next = snap(&["a", "b", "c"], Some(3));
        let first = db.apply_snapshot(p.id, &next, &s).unwrap();
        assert_eq!(first.follows, vec!["c"]);
        let replay = db.apply_snapshot(p.id, &next, &s).unwrap();
        assert_eq!(replay.event_count(), 0);
        assert!(db.list_entries(p.id).unwrap().iter().all(|e| e.miss_count == 0));
        assert_eq!(db.list_unprocessed(24).unwrap().len(), 1);
    }

    #[test]
    fn empty_snapshot_counts_as_miss_not_mass_unfollow() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let s = settings(2);
        db.apply_snapshot(p.id, &snap(&["a", "b", "c"], Some(3)), &s).unwrap();
        let out = db.apply_snapshot(p.id, &snap(&[], Some(3)), &s).unwrap();
        assert_eq!(out.event_count(), 0);
        let entries = db.list_entries(p.id).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.miss_count == 1));
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let (_dir, db) = test_db();
        assert!(db
            .apply_snapshot(42, &snap(&["a"], Some(1)), &DiffSettings::default())
            .is_err());
    }
}
