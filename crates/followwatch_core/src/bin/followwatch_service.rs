/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use followwatch_core::cycle::run_check_cycle;
use followwatch_core::delivery_queue::NotificationQueue;
use followwatch_core::protocol::ChangeType;
use followwatch_core::runtime::{self, seed_profiles, WatchConfig, WatchService};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, warn};

const USAGE: &str = "usage: followwatch_service [--config PATH] \
[run|check-once|deliver-once|add-profile HANDLE|stats|dead-letters|requeue PROFILE_ID TYPE]";

enum Command {
    Run,
    CheckOnce,
    DeliverOnce,
    AddProfile(String),
    Stats,
    DeadLetters,
    Requeue(i64, ChangeType),
}

fn default_config_path() -> PathBuf {
    if cfg!(target_os = "windows") {
        let base = std::env::var("APPDATA")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        return PathBuf::from(base).join("FollowWatch").join("config.json");
    }
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        return PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join("FollowWatch")
            .join("config.json");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("followwatch")
        .join("config.json")
}

fn parse_args() -> Result<(PathBuf, Command)> {
    let mut config: Option<PathBuf> = None;
    let mut rest = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }

    let config = match config {
        Some(p) => p,
        None => match std::env::var("FOLLOWWATCH_CONFIG") {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => default_config_path(),
        },
    };

    let command = match rest.first().map(String::as_str) {
        None | Some("run") => Command::Run,
        Some("check-once") => Command::CheckOnce,
        Some("deliver-once") => Command::DeliverOnce,
        Some("add-profile") => Command::AddProfile(rest.get(1).cloned().context(USAGE)?),
        Some("stats") => Command::Stats,
        Some("dead-letters") => Command::DeadLetters,
        Some("requeue") => {
            let profile_id = rest
                .get(1)
                .context(USAGE)?
                .parse::<i64>()
                .context("PROFILE_ID must be an integer")?;
            let change_type = rest
                .get(2)
                .and_then(|t| ChangeType::from_str(t))
                .context("TYPE must be FOLLOW or UNFOLLOW")?;
            Command::Requeue(profile_id, change_type)
        }
        Some(other) => anyhow::bail!("unknown command {other}\n{USAGE}"),
    };
    Ok((config, command))
}

fn load_config(path: &Path) -> Result<WatchConfig> {
    if !path.exists() {
        warn!("config missing: {} (using defaults)", path.display());
        return Ok(WatchConfig::default());
    }
    WatchConfig::load(path)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encode output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();
    let (cfg_path, command) = parse_args()?;
    info!("config: {}", cfg_path.display());
    let cfg = load_config(&cfg_path)?;

    match command {
        Command::Run => {
            let service = WatchService::start(&cfg)?;
            info!("followwatch service running");
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            info!("shutdown requested");
            service.stop().await;
        }
        Command::CheckOnce => {
            let db = cfg.open_db()?;
            seed_profiles(&db, &cfg.profiles)?;
            let provider = cfg.build_provider()?;
            let (_tx, rx) = watch::channel(false);
            let report = run_check_cycle(&db, provider.as_ref(), &cfg.diff_settings(), &rx).await?;
            print_json(&report)?;
        }
        Command::DeliverOnce => {
            let queue = NotificationQueue::new(cfg.open_db()?, cfg.queue_settings());
            let channel = cfg.build_channel()?;
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    let _ = tx.send(true);
                }
            });
            let report = queue.run_once(channel.as_ref(), rx).await?;
            info!(
                delivered = report.delivered_groups,
                events = report.delivered_events,
                transient = report.transient_failures,
                deferred = report.deferred,
                dead = report.dead_lettered,
                fatal = report.fatal_error.as_deref().unwrap_or(""),
                "delivery run finished"
            );
        }
        Command::AddProfile(handle) => {
            let profile = cfg.open_db()?.add_profile(&handle)?;
            print_json(&profile)?;
        }
        Command::Stats => {
            let queue = NotificationQueue::new(cfg.open_db()?, cfg.queue_settings());
            print_json(&queue.stats().await?)?;
        }
        Command::DeadLetters => {
            let queue = NotificationQueue::new(cfg.open_db()?, cfg.queue_settings());
            print_json(&queue.list_dead_letters().await?)?;
        }
        Command::Requeue(profile_id, change_type) => {
            let queue = NotificationQueue::new(cfg.open_db()?, cfg.queue_settings());
            if queue.requeue_group(profile_id, change_type).await? {
                info!(profile_id, change_type = %change_type, "group requeued");
            } else {
                warn!(profile_id, change_type = %change_type, "no retry state for group");
            }
        }
    }
    Ok(())
}
