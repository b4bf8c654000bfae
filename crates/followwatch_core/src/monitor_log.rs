/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::{now_ms, WatchDb};
use anyhow::Result;
use rusqlite::params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Success,
    Partial,
    Failed,
    NoChange,
    Skipped,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::NoChange => "NO_CHANGE",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "SUCCESS" => Some(Self::Success),
            "PARTIAL" => Some(Self::Partial),
            "FAILED" => Some(Self::Failed),
            "NO_CHANGE" => Some(Self::NoChange),
            "SKIPPED" => Some(Self::Skipped),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitorLogEntry {
    pub profile_id: i64,
    pub status: CheckStatus,
    /// Following count reported by the platform this cycle.
    pub live_count: Option<i64>,
    pub stored_count: i64,
    pub scraped_count: i64,
    /// scraped / live, when live is known.
    pub coverage: Option<f64>,
    pub new_follows: i64,
    pub new_unfollows: i64,
    pub error: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitorLogRow {
    pub id: i64,
    pub created_at_ms: i64,
    pub entry: MonitorLogEntry,
}

impl WatchDb {
    pub fn append_monitor_log(&self, entry: &MonitorLogEntry) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO monitor_log (
              profile_id, created_at_ms, status, live_count, stored_count, scraped_count,
              coverage, new_follows, new_unfollows, error, duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                entry.profile_id,
                now_ms(),
                entry.status.as_str(),
                entry.live_count,
                entry.stored_count,
                entry.scraped_count,
                entry.coverage,
                entry.new_follows,
                entry.new_unfollows,
                entry.error,
                entry.duration_ms,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent rows first. `profile_id = None` returns rows of every profile.
    pub fn recent_monitor_log(&self, profile_id: Option<i64>, limit: u32) -> Result<Vec<MonitorLogRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, created_at_ms, profile_id, status, live_count, stored_count, scraped_count,
                   coverage, new_follows, new_unfollows, error, duration_ms
            FROM monitor_log
            WHERE (?1 IS NULL OR profile_id = ?1)
            ORDER BY created_at_ms DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![profile_id, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(3)?;
            out.push(MonitorLogRow {
                id: row.get(0)?,
                created_at_ms: row.get(1)?,
                entry: MonitorLogEntry {
                    profile_id: row.get(2)?,
                    status: CheckStatus::from_str(&status).unwrap_or(CheckStatus::Error),
                    live_count: row.get(4)?,
                    stored_count: row.get(5)?,
                    scraped_count: row.get(6)?,
                    coverage: row.get(7)?,
                    new_follows: row.get(8)?,
                    new_unfollows: row.get(9)?,
                    error: row.get(10)?,
                    duration_ms: row.get(11)?,
                },
            });
        }
        Ok(out)
    }

    pub fn prune_monitor_log_before(&self, cutoff_ms: i64) -> Result<u64> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            "DELETE FROM monitor_log WHERE created_at_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn entry(profile_id: i64, status: CheckStatus) -> MonitorLogEntry {
        MonitorLogEntry {
            profile_id,
            status,
            live_count: Some(10),
            stored_count: 9,
            scraped_count: 9,
            coverage: Some(0.9),
            new_follows: 1,
            new_unfollows: 0,
            error: None,
            duration_ms: 1200,
        }
    }

    #[test]
    fn rows_are_filtered_by_profile_and_newest_first() {
        let (_dir, db) = test_db();
        db.append_monitor_log(&entry(1, CheckStatus::Success)).unwrap();
        db.append_monitor_log(&entry(2, CheckStatus::Failed)).unwrap();
        db.append_monitor_log(&entry(1, CheckStatus::NoChange)).unwrap();

        let rows = db.recent_monitor_log(Some(1), 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entry.status, CheckStatus::NoChange);
        assert_eq!(rows[1].entry.status, CheckStatus::Success);
        assert_eq!(rows[1].entry.coverage, Some(0.9));

        assert_eq!(db.recent_monitor_log(None, 10).unwrap().len(), 3);
        assert_eq!(db.recent_monitor_log(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn prune_drops_only_older_rows() {
        let (_dir, db) = test_db();
        db.append_monitor_log(&entry(1, CheckStatus::Skipped)).unwrap();
        assert_eq!(db.prune_monitor_log_before(0).unwrap(), 0);
        assert_eq!(db.prune_monitor_log_before(now_ms() + 1000).unwrap(), 1);
        assert!(db.recent_monitor_log(None, 10).unwrap().is_empty());
    }

    #[test]
    fn status_names_round_trip() {
        for s in [
            CheckStatus::Success,
            CheckStatus::Partial,
            CheckStatus::Failed,
            CheckStatus::NoChange,
            CheckStatus::Skipped,
            CheckStatus::Error,
        ] {
            assert_eq!(CheckStatus::from_str(s.as_str()), Some(s));
        }
    }
}
