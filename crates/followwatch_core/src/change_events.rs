/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::{now_ms, WatchDb};
use anyhow::Result;
use followwatch_protocol::ChangeType;
use rusqlite::{params, types::Type, Connection, Row};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChangeEvent {
    pub id: i64,
    pub profile_id: i64,
    pub change_type: ChangeType,
    pub target: String,
    pub target_display_name: String,
    pub detected_at_ms: i64,
    pub processed: bool,
    pub processed_at_ms: Option<i64>,
    pub evidence_ref: Option<String>,
    /// Failed delivery attempts while this event was part of a group.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct NewChangeEvent {
    pub profile_id: i64,
    pub change_type: ChangeType,
    pub target: String,
    pub target_display_name: String,
    pub evidence_ref: Option<String>,
}

impl NewChangeEvent {
    pub fn new(profile_id: i64, change_type: ChangeType, target: &str) -> Self {
        Self {
            profile_id,
            change_type,
            target: target.to_string(),
            target_display_name: target.to_string(),
            evidence_ref: None,
        }
    }
}

const EVENT_COLUMNS: &str = "id, profile_id, change_type, target, target_display_name, \
     detected_at_ms, processed, processed_at_ms, evidence_ref, attempts";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeEvent> {
    let kind: String = row.get(2)?;
    let change_type = ChangeType::from_str(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown change_type: {kind}").into(),
        )
    })?;
    Ok(ChangeEvent {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        change_type,
        target: row.get(3)?,
        target_display_name: row.get(4)?,
        detected_at_ms: row.get(5)?,
        processed: row.get::<_, i64>(6)? != 0,
        processed_at_ms: row.get(7)?,
        evidence_ref: row.get(8)?,
        attempts: row.get(9)?,
    })
}

pub(crate) fn max_age_cutoff_ms(now: i64, max_age_hours: u32) -> i64 {
    now.saturating_sub((max_age_hours as i64).saturating_mul(3600 * 1000))
}

impl WatchDb {
    /// Idempotent insert: when a pending event with the same (profile, type, target) exists
    /// nothing is written and `None` is returned.
    pub fn record_event(&self, event: &NewChangeEvent) -> Result<Option<i64>> {
        let conn = self.connect()?;
        insert_event(&conn, event, now_ms())
    }

    /// Pending events detected within the last `max_age_hours`, oldest first. Older pending
    /// events stay in the table; see [`WatchDb::list_stale_unprocessed`].
    pub fn list_unprocessed(&self, max_age_hours: u32) -> Result<Vec<ChangeEvent>> {
        let cutoff = max_age_cutoff_ms(now_ms(), max_age_hours);
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM change_events
            WHERE processed = 0 AND detected_at_ms >= ?1
            ORDER BY detected_at_ms ASC, id ASC
            "#
        ))?;
        let rows = stmt
            .query_map(params![cutoff], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Pending events that aged out of active processing. Kept for manual inspection.
    pub fn list_stale_unprocessed(&self, max_age_hours: u32, limit: u32) -> Result<Vec<ChangeEvent>> {
        let cutoff = max_age_cutoff_ms(now_ms(), max_age_hours);
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM change_events
            WHERE processed = 0 AND detected_at_ms < ?1
            ORDER BY detected_at_ms DESC, id DESC
            LIMIT ?2
            "#
        ))?;
        let rows = stmt
            .query_map(params![cutoff, limit], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_events(&self, profile_id: i64, limit: u32) -> Result<Vec<ChangeEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM change_events
            WHERE profile_id = ?1
            ORDER BY detected_at_ms DESC, id DESC
            LIMIT ?2
            "#
        ))?;
        let rows = stmt
            .query_map(params![profile_id, limit], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Marks events processed. Already processed ids are skipped, so repeating the call is
    /// harmless. Returns the number of rows that changed.
    pub fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let changed = mark_processed_in(&tx, ids, now_ms())?;
        tx.commit()?;
        Ok(changed)
    }
}

pub(crate) fn insert_event(
    conn: &Connection,
    event: &NewChangeEvent,
    detected_at_ms: i64,
) -> Result<Option<i64>> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO change_events (
          profile_id, change_type, target, target_display_name, detected_at_ms, processed, processed_at_ms, evidence_ref
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6)
        "#,
        params![
            event.profile_id,
            event.change_type.as_str(),
            event.target,
            event.target_display_name,
            detected_at_ms,
            event.evidence_ref,
        ],
    )?;
    if inserted == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

pub(crate) fn mark_processed_in(conn: &Connection, ids: &[i64], now: i64) -> Result<u64> {
    let mut stmt = conn.prepare(
        "UPDATE change_events SET processed = 1, processed_at_ms = ?2 WHERE id = ?1 AND processed = 0",
    )?;
    let mut changed: u64 = 0;
    for id in ids {
        changed += stmt.execute(params![id, now])? as u64;
    }
    Ok(changed)
}
