/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use followwatch_protocol::DeliveryMessage;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Worth retrying later (network, rate limit, upstream hiccup).
    Transient(String),
    /// The channel itself is unusable (session or credentials invalid).
    Fatal(String),
}

/// Outbound posting identity. The queue never calls `deliver` concurrently.
#[async_trait]
pub trait PostingChannel: Send + Sync {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome;
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ChannelConfig {
    /// "log" (default) or "webhook".
    pub kind: Option<String>,
    pub webhook_url: Option<String>,
    pub bearer_token: Option<String>,
    pub timeout_secs: Option<u64>,
}

pub fn build_channel(cfg: &ChannelConfig) -> Result<Arc<dyn PostingChannel>> {
    let kind = cfg
        .kind
        .as_deref()
        .unwrap_or("log")
        .trim()
        .to_ascii_lowercase();
    match kind.as_str() {
        "log" | "dry_run" | "dry-run" => Ok(Arc::new(LogChannel)),
        "webhook" => {
            let url = cfg
                .webhook_url
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .context("channel.webhook_url is required for the webhook channel")?;
            let timeout = Duration::from_secs(cfg.timeout_secs.unwrap_or(30).clamp(1, 600));
            Ok(Arc::new(WebhookChannel::new(url, cfg.bearer_token.clone(), timeout)?))
        }
        other => anyhow::bail!("unknown channel kind: {other}"),
    }
}

/// Posts the message JSON to a webhook. One HTTP attempt per delivery; the notification queue
/// owns retries.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl WebhookChannel {
    pub fn new(url: &str, bearer_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build webhook http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
        })
    }
}

#[async_trait]
impl PostingChannel for WebhookChannel {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
        let body = match serde_json::to_vec(message) {
            Ok(v) => v,
            Err(e) => return DeliveryOutcome::Transient(format!("encode message: {e}")),
        };
        let mut req = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(t) = &self.bearer_token {
            req = req.header(AUTHORIZATION, format!("Bearer {t}"));
        }
        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return DeliveryOutcome::Delivered;
                }
                let detail = resp.text().await.unwrap_or_default();
                classify_status(status, detail.trim())
            }
            Err(e) => DeliveryOutcome::Transient(format!("webhook send: {e}")),
        }
    }
}

pub fn classify_status(status: StatusCode, detail: &str) -> DeliveryOutcome {
    let detail: String = detail.chars().take(200).collect();
    let msg = if detail.is_empty() {
        format!("webhook status {status}")
    } else {
        format!("webhook status {status}: {detail}")
    };
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        DeliveryOutcome::Fatal(msg)
    } else {
        DeliveryOutcome::Transient(msg)
    }
}

/// Dry-run channel: logs every message and reports success.
pub struct LogChannel;

#[async_trait]
impl PostingChannel for LogChannel {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
        info!(
            profile = %message.profile_handle,
            change_type = %message.change_type,
            targets = message.targets.len(),
            "dry-run delivery: {}",
            message.text
        );
        DeliveryOutcome::Delivered
    }
}
