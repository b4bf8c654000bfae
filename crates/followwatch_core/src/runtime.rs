/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::channel::{build_channel, ChannelConfig, PostingChannel};
use crate::cycle::{start_check_worker, CheckWorkerConfig};
use crate::db::WatchDb;
use crate::delivery_queue::{NotificationQueue, QueueSettings};
use crate::diff::DiffSettings;
use crate::provider::{build_provider, ProviderConfig, SnapshotProvider};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DiffConfig {
    /// Consecutive absences tolerated before an unfollow is reported.
    pub miss_threshold: Option<u32>,
    pub completeness_ratio: Option<f64>,
    pub assume_complete_when_total_unknown: Option<bool>,
}

impl DiffConfig {
    pub fn resolve(&self) -> DiffSettings {
        let d = DiffSettings::default();
        DiffSettings {
            miss_threshold: self.miss_threshold.unwrap_or(d.miss_threshold).min(1000),
            completeness_ratio: self
                .completeness_ratio
                .filter(|r| r.is_finite())
                .unwrap_or(d.completeness_ratio)
                .clamp(0.0, 1.0),
            assume_complete_when_total_unknown: self
                .assume_complete_when_total_unknown
                .unwrap_or(d.assume_complete_when_total_unknown),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct QueueConfig {
    pub max_groups_per_run: Option<u32>,
    pub pacing_delay_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub max_age_hours: Option<u32>,
}

impl QueueConfig {
    pub fn resolve(&self) -> QueueSettings {
        let d = QueueSettings::default();
        QueueSettings {
            max_groups_per_run: self.max_groups_per_run.unwrap_or(d.max_groups_per_run).clamp(1, 1000),
            pacing_delay_secs: self.pacing_delay_secs.unwrap_or(d.pacing_delay_secs).min(24 * 3600),
            max_retries: self.max_retries.unwrap_or(d.max_retries).min(100),
            max_age_hours: self.max_age_hours.unwrap_or(d.max_age_hours).clamp(1, 24 * 365),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct WatchConfig {
    pub data_dir: Option<String>,
    /// Overrides `<data_dir>/followwatch.db`.
    pub db_path: Option<String>,
    pub check_interval_secs: Option<u64>,
    pub queue_interval_secs: Option<u64>,
    pub log_retention_days: Option<u32>,
    /// Handles registered (idempotently) at startup.
    #[serde(default)]
    pub profiles: Vec<String>,
    pub diff: Option<DiffConfig>,
    pub queue: Option<QueueConfig>,
    pub provider: Option<ProviderConfig>,
    pub channel: Option<ChannelConfig>,
}

impl WatchConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("parse config json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        if let Some(p) = self.db_path.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(PathBuf::from(p));
        }
        let dir = match self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(d) => PathBuf::from(d),
            None => default_data_dir()?,
        };
        Ok(dir.join("followwatch.db"))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.unwrap_or(3600).max(60))
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_secs.unwrap_or(300).max(30))
    }

    pub fn log_retention_days(&self) -> u32 {
        self.log_retention_days.unwrap_or(30).clamp(1, 3650)
    }

    pub fn diff_settings(&self) -> DiffSettings {
        self.diff.clone().unwrap_or_default().resolve()
    }

    pub fn queue_settings(&self) -> QueueSettings {
        self.queue.clone().unwrap_or_default().resolve()
    }

    pub fn open_db(&self) -> Result<WatchDb> {
        let path = self.db_path()?;
        WatchDb::open(&path).with_context(|| format!("open watch db: {}", path.display()))
    }

    pub fn build_provider(&self) -> Result<Arc<dyn SnapshotProvider>> {
        build_provider(&self.provider.clone().unwrap_or_default())
    }

    pub fn build_channel(&self) -> Result<Arc<dyn PostingChannel>> {
        build_channel(&self.channel.clone().unwrap_or_default())
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    let proj = ProjectDirs::from("net", "followwatch", "FollowWatch")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

/// Builds the log filter from a `RUST_LOG`-style value, falling back to `info` when it is
/// unset or unparsable.
pub fn log_filter(env_value: Option<&str>) -> EnvFilter {
    env_value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

pub fn init_tracing() {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(env.as_deref()))
        .try_init()
        .ok();
}

/// Registers each configured handle; returns the number of non-empty handles registered.
pub fn seed_profiles(db: &WatchDb, handles: &[String]) -> Result<usize> {
    let mut seeded = 0;
    for h in handles {
        if h.trim().trim_start_matches('@').is_empty() {
            warn!("ignoring empty profile handle in config");
            continue;
        }
        db.add_profile(h)
            .with_context(|| format!("register profile {h}"))?;
        seeded += 1;
    }
    Ok(seeded)
}

/// Running check and notification workers sharing one database.
pub struct WatchService {
    db: WatchDb,
    queue: NotificationQueue,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WatchService {
    pub fn start(cfg: &WatchConfig) -> Result<Self> {
        let db = cfg.open_db()?;
        info!("watch db: {}", db.path().display());
        let seeded = seed_profiles(&db, &cfg.profiles)?;
        if seeded > 0 {
            info!(seeded, "profiles registered from config");
        }
        let provider = cfg.build_provider()?;
        let channel = cfg.build_channel()?;
        Ok(Self::start_with(cfg, db, provider, channel))
    }

    /// Starts the workers with caller-supplied collaborators.
    pub fn start_with(
        cfg: &WatchConfig,
        db: WatchDb,
        provider: Arc<dyn SnapshotProvider>,
        channel: Arc<dyn PostingChannel>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = NotificationQueue::new(db.clone(), cfg.queue_settings());

        let check = start_check_worker(
            CheckWorkerConfig {
                interval: cfg.check_interval(),
                diff: cfg.diff_settings(),
                log_retention_days: cfg.log_retention_days(),
            },
            db.clone(),
            provider,
            queue.clone(),
            shutdown_rx.clone(),
        );
        let deliver = queue.start_worker(shutdown_rx, channel, cfg.queue_interval());
        info!(
            check_interval_secs = cfg.check_interval().as_secs(),
            queue_interval_secs = cfg.queue_interval().as_secs(),
            "followwatch workers started"
        );

        Self {
            db,
            queue,
            shutdown_tx,
            workers: vec![check, deliver],
        }
    }

    pub fn db(&self) -> &WatchDb {
        &self.db
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signals shutdown and waits for both workers to finish their current step.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for w in self.workers {
            if let Err(e) = w.await {
                warn!("worker join failed: {e}");
            }
        }
        info!("followwatch workers stopped");
    }
}
