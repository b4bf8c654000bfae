/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use rand::{thread_rng, Rng};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// Sends an idempotent request, retrying network errors, 429 and 5xx with jittered
/// exponential backoff (or the server's `Retry-After`, capped). The last response is returned
/// as-is once attempts run out.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match build().send().await {
            Ok(resp) => {
                if should_retry_status(resp.status()) && attempt < max_attempts {
                    match retry_after(resp.headers()) {
                        Some(wait) => tokio::time::sleep(wait).await,
                        None => sleep_with_jitter(backoff).await,
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e.into());
                }
                sleep_with_jitter(backoff).await;
                backoff = next_backoff(backoff);
            }
        }
    }
}

pub fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Delay-seconds form only; HTTP dates are treated as absent.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(Duration::from_secs(5))
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
