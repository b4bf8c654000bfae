/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// One retrieval of a profile's following list, as handed over by a snapshot provider.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    #[serde(default)]
    pub handles: Vec<String>,
    /// Following count reported by the platform, when it is known.
    #[serde(default, alias = "expectedTotal")]
    pub expected_total: Option<u64>,
}

impl Snapshot {
    pub fn new(handles: Vec<String>, expected_total: Option<u64>) -> Self {
        Self {
            handles,
            expected_total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Follow,
    Unfollow,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "FOLLOW",
            Self::Unfollow => "UNFOLLOW",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "follow" | "followed" | "new_follow" => Some(Self::Follow),
            "unfollow" | "unfollowed" => Some(Self::Unfollow),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub handle: String,
    #[serde(alias = "displayName")]
    pub display_name: String,
}

/// Grouped notification handed to a posting channel: every target shares the
/// originating profile and change type.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeliveryMessage {
    #[serde(alias = "profileHandle")]
    pub profile_handle: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub targets: Vec<DeliveryTarget>,
    #[serde(default, alias = "evidenceRef", skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    /// Pre-rendered text, for channels that post verbatim.
    #[serde(default)]
    pub text: String,
}
