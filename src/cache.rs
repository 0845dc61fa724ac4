// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory key/value store with per-key TTL (§4.2). Expired entries are
//! treated as absent on read and swept lazily on insert.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

pub struct HotCache {
    map: DashMap<String, Entry>,
}

/// TTL for `mail_obj:*` entries (§4.2).
pub const MAIL_OBJ_TTL: Duration = Duration::from_secs(86_400);

/// TTL for `smart_rules:*` entries (§4.2).
pub const SMART_RULES_TTL: Duration = Duration::from_secs(3_600);

impl Default for HotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HotCache {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Duration) {
        self.set_raw(key, value, Some(ttl));
    }

    /// `draft_stage:*` entries have no TTL until consumed (§4.2).
    pub fn set_no_ttl<T: Serialize>(&self, key: impl Into<String>, value: &T) {
        self.set_raw(key, value, None);
    }

    fn set_raw<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Option<Duration>) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            let expires_at = ttl.map(|d| Instant::now() + d);
            self.map.insert(key.into(), Entry { value: bytes, expires_at });
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.map.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                drop(entry);
                self.map.remove(key);
                return None;
            }
        }
        serde_json::from_slice(&entry.value).ok()
    }

    pub fn remove(&self, key: &str) {
        self.map.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get::<serde_json::Value>(key).is_some()
    }

    /// Lists every live (non-expired) key starting with `prefix`, without
    /// consuming them. Used by the draft uplink to drain `draft_stage:*`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.map
            .iter()
            .filter(|kv| kv.key().starts_with(prefix))
            .filter(|kv| kv.value().expires_at.map(|e| Instant::now() < e).unwrap_or(true))
            .map(|kv| kv.key().clone())
            .collect()
    }

    /// Removes every key whose name starts with `prefix`. Used for the
    /// "invalidate every `mail:<user>:list:<folder>:*` key" rule (§4.2).
    pub fn remove_prefix(&self, prefix: &str) {
        let keys: Vec<String> =
            self.map.iter().map(|kv| kv.key().clone()).filter(|k| k.starts_with(prefix)).collect();
        for key in keys {
            self.map.remove(&key);
        }
    }

    // --- key builders (§4.2) ---

    pub fn mail_obj_key(user: &str, id: &str) -> String {
        format!("mail_obj:{}:{}", id, user)
    }

    pub fn list_key(user: &str, folder: &str, category: &str) -> String {
        format!("mail:{}:list:{}:{}", user, folder, category)
    }

    pub fn list_prefix(user: &str, folder: &str) -> String {
        format!("mail:{}:list:{}:", user, folder)
    }

    pub fn sync_progress_key(user: &str) -> String {
        format!("sync_progress:{}", user)
    }

    pub fn sync_active_key(user: &str) -> String {
        format!("sync_active:{}", user)
    }

    pub fn folder_map_key(user: &str) -> String {
        format!("folder_map:{}", user)
    }

    pub fn smart_rules_key(user: &str) -> String {
        format!("smart_rules:{}", user)
    }

    pub fn draft_stage_key(user: &str, client_draft_id: &str) -> String {
        format!("draft_stage:{}:{}", user, client_draft_id)
    }

    /// Prefix shared by every `draft_stage:<user>:*` key, derived from
    /// `draft_stage_key` rather than hand-formatted so the two can't drift.
    pub fn draft_stage_prefix(user: &str) -> String {
        Self::draft_stage_key(user, "")
    }

    /// Invalidates a mutated message's own entry plus every list snapshot for the
    /// affected folder (§4.2 invalidation rules).
    pub fn invalidate_message(&self, user: &str, id: &str, folder: &str) {
        self.remove(&Self::mail_obj_key(user, id));
        self.remove_prefix(&Self::list_prefix(user, folder));
    }

    /// Category reassignment invalidates all five Inbox category snapshots (§4.2).
    pub fn invalidate_inbox_categories(&self, user: &str) {
        self.remove_prefix(&Self::list_prefix(user, "Inbox"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache = HotCache::new();
        cache.set("k", &"v".to_string(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get::<String>("k"), None);
    }

    #[test]
    fn fresh_entry_round_trips() {
        let cache = HotCache::new();
        cache.set("k", &42u32, Duration::from_secs(60));
        assert_eq!(cache.get::<u32>("k"), Some(42));
    }

    #[test]
    fn remove_prefix_clears_matching_keys_only() {
        let cache = HotCache::new();
        cache.set("mail:u:list:Inbox:all", &1u32, Duration::from_secs(60));
        cache.set("mail:u:list:Inbox:social", &1u32, Duration::from_secs(60));
        cache.set("mail:u:list:Sent:all", &1u32, Duration::from_secs(60));
        cache.remove_prefix(&HotCache::list_prefix("u", "Inbox"));
        assert!(cache.get::<u32>("mail:u:list:Inbox:all").is_none());
        assert!(cache.get::<u32>("mail:u:list:Inbox:social").is_none());
        assert!(cache.get::<u32>("mail:u:list:Sent:all").is_some());
    }

    #[test]
    fn keys_with_prefix_lists_matching_live_keys() {
        let cache = HotCache::new();
        cache.set_no_ttl("draft_stage:u:a", &"1".to_string());
        cache.set_no_ttl("draft_stage:u:b", &"2".to_string());
        cache.set_no_ttl("draft_stage:other:a", &"3".to_string());
        let mut keys = cache.keys_with_prefix("draft_stage:u:");
        keys.sort();
        assert_eq!(keys, vec!["draft_stage:u:a".to_string(), "draft_stage:u:b".to_string()]);
    }

    #[test]
    fn draft_stage_prefix_matches_key_prefix() {
        let key = HotCache::draft_stage_key("alice", "c1");
        let prefix = HotCache::draft_stage_prefix("alice");
        assert!(key.starts_with(&prefix));
        assert_eq!(prefix, "draft_stage:alice:");
    }

    #[test]
    fn no_ttl_entry_persists_until_removed() {
        let cache = HotCache::new();
        cache.set_no_ttl("draft_stage:u:c1", &"body".to_string());
        assert_eq!(cache.get::<String>("draft_stage:u:c1"), Some("body".to_string()));
    }
}
