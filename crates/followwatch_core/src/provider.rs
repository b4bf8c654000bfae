/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_retry::send_with_retry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use followwatch_protocol::Snapshot;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use std::sync::Arc;
use std::time::Duration;

/// Source of following-list snapshots. Implementations must return a fresh retrieval on every
/// call; partial or empty results are fine and are handled by the diff engine.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn get_snapshot(&self, profile_handle: &str) -> Result<Snapshot>;
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ProviderConfig {
    /// URL template; `{handle}` is replaced with the url-encoded profile handle.
    pub snapshot_url: Option<String>,
    pub bearer_token: Option<String>,
    pub timeout_secs: Option<u64>,
    pub attempts: Option<u32>,
}

pub fn build_provider(cfg: &ProviderConfig) -> Result<Arc<dyn SnapshotProvider>> {
    let template = cfg
        .snapshot_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .context("provider.snapshot_url is required")?;
    let provider = HttpSnapshotProvider::new(
        template,
        cfg.bearer_token.clone(),
        Duration::from_secs(cfg.timeout_secs.unwrap_or(120).clamp(5, 1800)),
        cfg.attempts.unwrap_or(3),
    )?;
    Ok(Arc::new(provider))
}

/// Fetches snapshots as JSON (`{"handles": [...], "expected_total": n}`) from an external
/// scraper service.
pub struct HttpSnapshotProvider {
    client: reqwest::Client,
    url_template: String,
    bearer_token: Option<String>,
    attempts: u32,
}

impl HttpSnapshotProvider {
    pub fn new(
        url_template: &str,
        bearer_token: Option<String>,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build snapshot http client")?;
        Ok(Self {
            client,
            url_template: url_template.to_string(),
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
            attempts,
        })
    }

    pub fn url_for(&self, profile_handle: &str) -> String {
        self.url_template
            .replace("{handle}", &urlencoding::encode(profile_handle))
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn get_snapshot(&self, profile_handle: &str) -> Result<Snapshot> {
        let url = self.url_for(profile_handle);
        let resp = send_with_retry(
            || {
                let req = self
                    .client
                    .get(&url)
                    .header(ACCEPT, "application/json")
                    .header(CACHE_CONTROL, "no-cache");
                match &self.bearer_token {
                    Some(t) => req.header(AUTHORIZATION, format!("Bearer {t}")),
                    None => req,
                }
            },
            self.attempts,
        )
        .await
        .with_context(|| format!("fetch snapshot: {url}"))?
        .error_for_status()
        .with_context(|| format!("snapshot not ok: {url}"))?;

        let text = resp.text().await?;
        let snapshot: Snapshot = serde_json::from_str(&text)
            .with_context(|| format!("parse snapshot json from {url}"))?;
        Ok(snapshot)
    }
}
