// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Domain types shared by storage, cache, sync, and mutation (§3).

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

lazy_static! {
    static ref COMPOSITE_ID_RE: Regex = Regex::new(r"^uid-(\d+)-(.+)$").unwrap();
}

/// One of the four Inbox-only smart tabs (§4.8, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Primary,
    Social,
    Updates,
    Promotions,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Primary => "primary",
            Category::Social => "social",
            Category::Updates => "updates",
            Category::Promotions => "promotions",
        }
    }

    pub fn all() -> [Category; 4] {
        [Category::Primary, Category::Social, Category::Updates, Category::Promotions]
    }
}

/// Where a returned message payload was resolved from (Design Notes §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Hot,
    Warm,
    RemoteLive,
    RemoteLiveViaStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub blob_key: String,
    pub size: u64,
    pub mime_type: String,
    pub content_id: Option<String>,
}

/// Stable composite id `uid-<U>-<folder>` (§3, §9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(uid: u32, folder: &str) -> Self {
        MessageId(format!("uid-{}-{}", uid, folder))
    }

    /// Recovers the numeric uid and canonical folder name from a composite id.
    pub fn parse(id: &str) -> Result<(u32, String), BridgeError> {
        let caps = COMPOSITE_ID_RE
            .captures(id)
            .ok_or_else(|| BridgeError::ValidationError(format!("malformed message id: {}", id)))?;
        let uid: u32 = caps[1]
            .parse()
            .map_err(|_| BridgeError::ValidationError(format!("malformed uid in id: {}", id)))?;
        Ok((uid, caps[2].to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Primary entity: a synchronized message (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub uid: u32,
    pub user: String,

    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub timestamp_ms: i64,

    pub body: String,
    pub preview: String,
    pub is_full_body: bool,

    pub read: bool,
    pub folder: String,
    pub labels: Vec<String>,
    pub category: Option<Category>,

    pub attachments: Vec<Attachment>,
}

impl Message {
    /// New envelope-only row, as produced by the sync orchestrator before hydration.
    pub fn new_envelope(
        user: impl Into<String>,
        uid: u32,
        folder: impl Into<String>,
        from_address: impl Into<String>,
        from_name: Option<String>,
        to_addresses: Vec<String>,
        subject: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        let folder = folder.into();
        let id = MessageId::new(uid, &folder).0;
        Message {
            id,
            uid,
            user: user.into(),
            from_address: from_address.into(),
            from_name,
            to_addresses,
            subject: subject.into(),
            timestamp_ms,
            body: String::new(),
            preview: String::new(),
            is_full_body: false,
            read: false,
            folder,
            labels: Vec::new(),
            category: None,
            attachments: Vec::new(),
        }
    }
}

/// Per-user credentials and setup state (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub remote_user: String,
    pub remote_pass: String,
    pub submission_host: String,
    pub submission_port: u16,
    pub use_tls: bool,
    pub setup_complete: bool,
    pub last_sync: Option<i64>,
}

/// `{id, user, name, color}`; `id = lowercase(name, spaces→dashes)` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub user: String,
    pub name: String,
    pub color: String,
}

impl Label {
    pub fn id_for(name: &str) -> String {
        name.to_lowercase().replace(' ', "-")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    From,
    Subject,
    Content,
}

/// `{user, category, type, value}`; unique on `(user, category, value)` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub user: String,
    pub category: Category,
    pub rule_type: RuleType,
    pub value: String,
}

/// Hydration/fetch work item. Lower `priority` means sooner (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub priority: u8,
    pub added_at_ms: i64,
    pub uid: u32,
    pub folder: String,
    pub user: String,
    pub attempts: u8,
}

impl Job {
    pub const PRIORITY_FOREGROUND: u8 = 1;
    pub const PRIORITY_PREWARM: u8 = 2;
    pub const PRIORITY_BACKGROUND: u8 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_id_round_trips() {
        let id = MessageId::new(42, "Inbox");
        assert_eq!(id.as_str(), "uid-42-Inbox");
        let (uid, folder) = MessageId::parse(id.as_str()).unwrap();
        assert_eq!(uid, 42);
        assert_eq!(folder, "Inbox");
    }

    #[test]
    fn composite_id_rejects_garbage() {
        assert!(MessageId::parse("not-an-id").is_err());
    }

    #[test]
    fn label_id_lowercases_and_dashes_spaces() {
        assert_eq!(Label::id_for("Work Stuff"), "work-stuff");
    }
}
