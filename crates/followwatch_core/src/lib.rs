/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod baseline;
pub mod change_events;
pub mod channel;
pub mod cycle;
pub mod db;
pub mod delivery_queue;
pub mod diff;
pub mod http_retry;
pub mod message;
pub mod monitor_log;
pub mod provider;
pub mod runtime;

pub use db::WatchDb;
pub use followwatch_protocol as protocol;
