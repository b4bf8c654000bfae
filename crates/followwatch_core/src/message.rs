/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use followwatch_protocol::{ChangeType, DeliveryMessage, DeliveryTarget};

/// Targets listed by name before the rest are summarised.
pub const MAX_LISTED_TARGETS: usize = 20;

pub fn build_message(
    profile_handle: &str,
    change_type: ChangeType,
    targets: Vec<DeliveryTarget>,
    evidence_ref: Option<String>,
) -> DeliveryMessage {
    let text = format_text(profile_handle, change_type, &targets);
    DeliveryMessage {
        profile_handle: profile_handle.to_string(),
        change_type,
        targets,
        evidence_ref,
        text,
    }
}

pub fn format_text(profile_handle: &str, change_type: ChangeType, targets: &[DeliveryTarget]) -> String {
    let verb = match change_type {
        ChangeType::Follow => "followed",
        ChangeType::Unfollow => "unfollowed",
    };
    let listed = targets
        .iter()
        .take(MAX_LISTED_TARGETS)
        .map(describe_target)
        .collect::<Vec<_>>()
        .join(", ");
    let rest = targets.len().saturating_sub(MAX_LISTED_TARGETS);
    let noun = if targets.len() == 1 { "account" } else { "accounts" };
    if rest > 0 {
        format!(
            "@{profile_handle} {verb} {} {noun}: {listed} and {rest} more",
            targets.len()
        )
    } else if targets.len() == 1 {
        format!("@{profile_handle} {verb} {listed}")
    } else {
        format!("@{profile_handle} {verb} {} {noun}: {listed}", targets.len())
    }
}

fn describe_target(t: &DeliveryTarget) -> String {
    let name = t.display_name.trim();
    if name.is_empty() || name.eq_ignore_ascii_case(&t.handle) {
        format!("@{}", t.handle)
    } else {
        format!("{name} (@{})", t.handle)
    }
}
