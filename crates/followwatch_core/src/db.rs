/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Handle on the watch database. Only the path is shared; every operation opens its own
/// connection, so the handle is cheap to clone into blocking tasks.
#[derive(Clone)]
pub struct WatchDb {
    path: PathBuf,
}

impl WatchDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db dir: {}", parent.display()))?;
            }
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS monitored_profiles (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              handle TEXT NOT NULL UNIQUE,
              baseline_state INTEGER NOT NULL DEFAULT 0,
              baseline_at_ms INTEGER NULL,
              baseline_following_count INTEGER NULL,
              last_following_count INTEGER NULL,
              last_check_at_ms INTEGER NULL,
              created_at_ms INTEGER NOT NULL
            );

            -- One row per (profile, followed handle) currently believed to hold.
            CREATE TABLE IF NOT EXISTS following_entries (
              profile_id INTEGER NOT NULL,
              handle TEXT NOT NULL,
              position INTEGER NOT NULL,
              last_seen_ms INTEGER NOT NULL,
              miss_count INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY(profile_id, handle)
            );

            CREATE TABLE IF NOT EXISTS change_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              profile_id INTEGER NOT NULL,
              change_type TEXT NOT NULL,
              target TEXT NOT NULL,
              target_display_name TEXT NOT NULL,
              detected_at_ms INTEGER NOT NULL,
              processed INTEGER NOT NULL DEFAULT 0,
              processed_at_ms INTEGER NULL
            );
            -- At most one pending row per (profile, type, target); processed rows are history.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_pending_key
              ON change_events(profile_id, change_type, target) WHERE processed = 0;
            CREATE INDEX IF NOT EXISTS idx_events_pending_detected
              ON change_events(processed, detected_at_ms);
            -- Group-level retry rows from older databases; retry state now lives on the events.
            DROP TABLE IF EXISTS delivery_groups;

            CREATE TABLE IF NOT EXISTS monitor_log (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              profile_id INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              status TEXT NOT NULL,
              live_count INTEGER NULL,
              stored_count INTEGER NOT NULL,
              scraped_count INTEGER NOT NULL,
              coverage REAL NULL,
              new_follows INTEGER NOT NULL,
              new_unfollows INTEGER NOT NULL,
              error TEXT NULL,
              duration_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_monitor_log_profile_created
              ON monitor_log(profile_id, created_at_ms DESC);
            "#,
        )?;
        ensure_columns(&conn, "monitored_profiles", &[
            ("active", "INTEGER NOT NULL DEFAULT 1"),
        ])?;
        ensure_columns(&conn, "change_events", &[
            ("evidence_ref", "TEXT NULL"),
            // Delivery retry state, per event: a group's counter is the highest among its events.
            ("attempts", "INTEGER NOT NULL DEFAULT 0"),
            ("last_error", "TEXT NULL"),
            ("last_attempt_at_ms", "INTEGER NULL"),
        ])?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        // Check and queue workers share the file; wait for the writer instead of failing.
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(conn)
    }
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, WatchDb) {
    let dir = tempfile::tempdir().unwrap();
    let db = WatchDb::open(dir.path().join("watch.sqlite")).unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_repeatable_and_migrates_columns() {
        let (dir, db) = test_db();
        db.health_check().unwrap();

        let again = WatchDb::open(dir.path().join("watch.sqlite")).unwrap();
        let conn = again.connect().unwrap();
        let mut stmt = conn.prepare("PRAGMA table_info(change_events)").unwrap();
        let cols = stmt
            .query_map([], |r| r.get::<_, String>(1))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        assert!(cols.iter().any(|c| c == "evidence_ref"));
        assert!(cols.iter().any(|c| c == "attempts"));
    }

    #[test]
    fn open_creates_missing_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("watch.sqlite");
        let db = WatchDb::open(&path).unwrap();
        assert_eq!(db.path(), path.as_path());
        assert!(path.exists());
    }
}
