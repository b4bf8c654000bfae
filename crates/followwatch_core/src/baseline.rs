/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::{now_ms, WatchDb};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BaselineState {
    Uninitialized,
    BuildingBaseline,
    BaselineComplete,
}

impl BaselineState {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Uninitialized => 0,
            Self::BuildingBaseline => 1,
            Self::BaselineComplete => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::BuildingBaseline,
            2 => Self::BaselineComplete,
            _ => Self::Uninitialized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::BuildingBaseline => "BUILDING_BASELINE",
            Self::BaselineComplete => "BASELINE_COMPLETE",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitoredProfile {
    pub id: i64,
    pub handle: String,
    pub active: bool,
    pub baseline_state: BaselineState,
    pub baseline_at_ms: Option<i64>,
    /// Following count observed when the baseline was accepted.
    pub baseline_following_count: Option<i64>,
    pub last_following_count: Option<i64>,
    pub last_check_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FollowingEntry {
    pub profile_id: i64,
    pub handle: String,
    /// Last index seen in a snapshot. Ordering hint only.
    pub position: i64,
    pub last_seen_ms: i64,
    pub miss_count: u32,
}

const PROFILE_COLUMNS: &str = "id, handle, active, baseline_state, baseline_at_ms, \
     baseline_following_count, last_following_count, last_check_at_ms, created_at_ms";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<MonitoredProfile> {
    Ok(MonitoredProfile {
        id: row.get(0)?,
        handle: row.get(1)?,
        active: row.get::<_, i64>(2)? != 0,
        baseline_state: BaselineState::from_i64(row.get(3)?),
        baseline_at_ms: row.get(4)?,
        baseline_following_count: row.get(5)?,
        last_following_count: row.get(6)?,
        last_check_at_ms: row.get(7)?,
        created_at_ms: row.get(8)?,
    })
}

/// Canonical form of a handle: trimmed, without a leading `@`, lowercase.
pub fn normalize_handle(input: &str) -> String {
    input.trim().trim_start_matches('@').trim().to_lowercase()
}

/// Normalises a snapshot's handles, dropping empties and later duplicates.
/// The returned order is the position order used for the entries.
pub fn normalize_handles(handles: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(handles.len());
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        let h = normalize_handle(h);
        if h.is_empty() {
            continue;
        }
        if seen.insert(h.clone()) {
            out.push(h);
        }
    }
    out
}

impl WatchDb {
    /// Registers a profile for monitoring. Re-adding an existing handle returns the stored row
    /// unchanged.
    pub fn add_profile(&self, handle: &str) -> Result<MonitoredProfile> {
        let handle = normalize_handle(handle);
        if handle.is_empty() {
            anyhow::bail!("profile handle is empty");
        }
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO monitored_profiles(handle, baseline_state, created_at_ms) VALUES (?1, ?2, ?3)",
            params![handle, BaselineState::Uninitialized.as_i64(), now_ms()],
        )?;
        get_profile_by_handle(&conn, &handle)?
            .with_context(|| format!("profile vanished after insert: {handle}"))
    }

    pub fn get_profile(&self, id: i64) -> Result<Option<MonitoredProfile>> {
        let conn = self.connect()?;
        load_profile(&conn, id)
    }

    pub fn get_profile_by_handle(&self, handle: &str) -> Result<Option<MonitoredProfile>> {
        let conn = self.connect()?;
        get_profile_by_handle(&conn, &normalize_handle(handle))
    }

    pub fn list_profiles(&self, active_only: bool) -> Result<Vec<MonitoredProfile>> {
        let conn = self.connect()?;
        let sql = if active_only {
            format!("SELECT {PROFILE_COLUMNS} FROM monitored_profiles WHERE active = 1 ORDER BY id ASC")
        } else {
            format!("SELECT {PROFILE_COLUMNS} FROM monitored_profiles ORDER BY id ASC")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], profile_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_profile_active(&self, id: i64, active: bool) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE monitored_profiles SET active = ?2 WHERE id = ?1",
            params![id, active as i64],
        )?;
        Ok(changed > 0)
    }

    /// Drops every stored entry and returns the profile to `UNINITIALIZED`; the next snapshot
    /// starts a fresh baseline. Pending change events are left alone.
    pub fn reset_baseline(&self, id: i64) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM following_entries WHERE profile_id = ?1", params![id])?;
        let changed = tx.execute(
            r#"
            UPDATE monitored_profiles
            SET baseline_state = ?2, baseline_at_ms = NULL, baseline_following_count = NULL
            WHERE id = ?1
            "#,
            params![id, BaselineState::Uninitialized.as_i64()],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn list_entries(&self, profile_id: i64) -> Result<Vec<FollowingEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT profile_id, handle, position, last_seen_ms, miss_count
            FROM following_entries
            WHERE profile_id = ?1
            ORDER BY position ASC, handle ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![profile_id], |row| {
                Ok(FollowingEntry {
                    profile_id: row.get(0)?,
                    handle: row.get(1)?,
                    position: row.get(2)?,
                    last_seen_ms: row.get(3)?,
                    miss_count: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn entry_count(&self, profile_id: i64) -> Result<u64> {
        let conn = self.connect()?;
        count_entries(&conn, profile_id)
    }
}

pub(crate) fn load_profile(conn: &Connection, id: i64) -> Result<Option<MonitoredProfile>> {
    let sql = format!("SELECT {PROFILE_COLUMNS} FROM monitored_profiles WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], profile_from_row).optional()?)
}

fn get_profile_by_handle(conn: &Connection, handle: &str) -> Result<Option<MonitoredProfile>> {
    let sql = format!("SELECT {PROFILE_COLUMNS} FROM monitored_profiles WHERE handle = ?1");
    Ok(conn.query_row(&sql, params![handle], profile_from_row).optional()?)
}

/// Miss counters of every stored entry, keyed by handle.
pub(crate) fn load_entry_misses(conn: &Connection, profile_id: i64) -> Result<HashMap<String, u32>> {
    let mut stmt =
        conn.prepare("SELECT handle, miss_count FROM following_entries WHERE profile_id = ?1")?;
    let mut rows = stmt.query(params![profile_id])?;
    let mut out = HashMap::new();
    while let Some(row) = rows.next()? {
        out.insert(row.get::<_, String>(0)?, row.get::<_, u32>(1)?);
    }
    Ok(out)
}

pub(crate) fn count_entries(conn: &Connection, profile_id: i64) -> Result<u64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM following_entries WHERE profile_id = ?1",
        params![profile_id],
        |r| r.get(0),
    )?)
}

/// Baseline merge: adds unseen handles and refreshes seen ones without touching miss counters.
pub(crate) fn merge_entry(
    conn: &Connection,
    profile_id: i64,
    handle: &str,
    position: i64,
    now: i64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO following_entries(profile_id, handle, position, last_seen_ms, miss_count)
        VALUES (?1, ?2, ?3, ?4, 0)
        ON CONFLICT(profile_id, handle) DO UPDATE SET
          position = excluded.position,
          last_seen_ms = excluded.last_seen_ms
        "#,
        params![profile_id, handle, position, now],
    )?;
    Ok(())
}

/// Inserts a first sighting. Returns false when the row already existed (for example written
/// by a concurrent cycle), in which case it is confirmed instead.
pub(crate) fn insert_entry(
    conn: &Connection,
    profile_id: i64,
    handle: &str,
    position: i64,
    now: i64,
) -> Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO following_entries(profile_id, handle, position, last_seen_ms, miss_count)
        VALUES (?1, ?2, ?3, ?4, 0)
        "#,
        params![profile_id, handle, position, now],
    )?;
    if inserted == 0 {
        confirm_entry(conn, profile_id, handle, position, now)?;
        return Ok(false);
    }
    Ok(true)
}

pub(crate) fn confirm_entry(
    conn: &Connection,
    profile_id: i64,
    handle: &str,
    position: i64,
    now: i64,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE following_entries
        SET miss_count = 0, position = ?3, last_seen_ms = ?4
        WHERE profile_id = ?1 AND handle = ?2
        "#,
        params![profile_id, handle, position, now],
    )?;
    Ok(())
}

/// Increments the miss counter in place and returns the new value, or `None` when the row is
/// already gone.
pub(crate) fn bump_miss(conn: &Connection, profile_id: i64, handle: &str) -> Result<Option<u32>> {
    Ok(conn
        .query_row(
            r#"
            UPDATE following_entries SET miss_count = miss_count + 1
            WHERE profile_id = ?1 AND handle = ?2
            RETURNING miss_count
            "#,
            params![profile_id, handle],
            |r| r.get(0),
        )
        .optional()?)
}

pub(crate) fn delete_entry(conn: &Connection, profile_id: i64, handle: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM following_entries WHERE profile_id = ?1 AND handle = ?2",
        params![profile_id, handle],
    )?;
    Ok(deleted > 0)
}

pub(crate) fn record_check(
    conn: &Connection,
    profile_id: i64,
    observed_count: Option<i64>,
    now: i64,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE monitored_profiles
        SET last_check_at_ms = ?2, last_following_count = COALESCE(?3, last_following_count)
        WHERE id = ?1
        "#,
        params![profile_id, now, observed_count],
    )?;
    Ok(())
}

pub(crate) fn set_baseline_state(
    conn: &Connection,
    profile_id: i64,
    state: BaselineState,
    baseline_count: Option<i64>,
    now: i64,
) -> Result<()> {
    if state == BaselineState::BaselineComplete {
        conn.execute(
            r#"
            UPDATE monitored_profiles
            SET baseline_state = ?2, baseline_at_ms = ?3, baseline_following_count = ?4
            WHERE id = ?1
            "#,
            params![profile_id, state.as_i64(), now, baseline_count],
        )?;
    } else {
        conn.execute(
            "UPDATE monitored_profiles SET baseline_state = ?2 WHERE id = ?1",
            params![profile_id, state.as_i64()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn handles_are_normalized_and_deduplicated() {
        let raw = vec![
            " @Alice ".to_string(),
            "bob".to_string(),
            "".to_string(),
            "@".to_string(),
            "ALICE".to_string(),
            "carol".to_string(),
        ];
        assert_eq!(normalize_handles(&raw), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn add_profile_is_idempotent() {
        let (_dir, db) = test_db();
        let first = db.add_profile("@Watched").unwrap();
        let second = db.add_profile("watched").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.handle, "watched");
        assert_eq!(first.baseline_state, BaselineState::Uninitialized);
        assert!(first.active);
        assert_eq!(db.list_profiles(false).unwrap().len(), 1);
        assert!(db.add_profile("  ").is_err());
    }

    #[test]
    fn inactive_profiles_are_filtered() {
        let (_dir, db) = test_db();
        let a = db.add_profile("a").unwrap();
        db.add_profile("b").unwrap();
        assert!(db.set_profile_active(a.id, false).unwrap());
        let active = db.list_profiles(true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].handle, "b");
        assert!(!db.set_profile_active(999, true).unwrap());
    }

    #[test]
    fn miss_counter_increments_atomically() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        let conn = db.connect().unwrap();
        assert!(insert_entry(&conn, p.id, "x", 0, 1).unwrap());
        assert!(!insert_entry(&conn, p.id, "x", 3, 2).unwrap());
        assert_eq!(bump_miss(&conn, p.id, "x").unwrap(), Some(1));
        assert_eq!(bump_miss(&conn, p.id, "x").unwrap(), Some(2));
        assert_eq!(bump_miss(&conn, p.id, "missing").unwrap(), None);

        confirm_entry(&conn, p.id, "x", 5, 10).unwrap();
        let entries = db.list_entries(p.id).unwrap();
        assert_eq!(entries[0].miss_count, 0);
        assert_eq!(entries[0].position, 5);
        assert_eq!(entries[0].last_seen_ms, 10);
    }

    #[test]
    fn reset_baseline_clears_entries() {
        let (_dir, db) = test_db();
        let p = db.add_profile("watched").unwrap();
        {
            let conn = db.connect().unwrap();
            merge_entry(&conn, p.id, "x", 0, 1).unwrap();
            set_baseline_state(&conn, p.id, BaselineState::BaselineComplete, Some(1), 1).unwrap();
        }
        assert!(db.reset_baseline(p.id).unwrap());
        let p = db.get_profile(p.id).unwrap().unwrap();
        assert_eq!(p.baseline_state, BaselineState::Uninitialized);
        assert_eq!(p.baseline_at_ms, None);
        assert!(db.list_entries(p.id).unwrap().is_empty());
    }
}
