// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Translates canonical folder names (Inbox/Sent/Drafts/Trash/Spam) to
//! server-specific paths, using special-use flags with a name-based fallback (§4.4).

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::HotCache;
use crate::imap::Folder;

const CACHE_TTL: Duration = Duration::from_secs(60);

pub struct FolderMapper<'a> {
    cache: &'a HotCache,
}

impl<'a> FolderMapper<'a> {
    pub fn new(cache: &'a HotCache) -> Self {
        Self { cache }
    }

    /// Maps every canonical name to a server path, consulting the 60 s cache
    /// before falling back to the supplied folder listing (§4.4).
    pub async fn resolve(&self, user: &str, folders: &[Folder]) -> HashMap<String, String> {
        let key = HotCache::folder_map_key(user);
        if let Some(map) = self.cache.get::<HashMap<String, String>>(&key) {
            return map;
        }

        let map = build_map(folders);
        self.cache.set(key, &map, CACHE_TTL);
        map
    }
}

fn build_map(folders: &[Folder]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("Inbox".to_string(), "INBOX".to_string());

    for folder in folders {
        if let Some(canonical) = canonical_from_flags(&folder.attributes) {
            map.entry(canonical.to_string()).or_insert_with(|| folder.full_path.clone());
        }
    }

    for canonical in ["Sent", "Drafts", "Trash"] {
        if !map.contains_key(canonical) {
            if let Some(folder) = folders.iter().find(|f| matches_by_name(canonical, &f.name)) {
                map.insert(canonical.to_string(), folder.full_path.clone());
            }
        }
    }

    if !map.contains_key("Spam") {
        if let Some(folder) = folders.iter().find(|f| matches_by_name("Spam", &f.name)) {
            map.insert("Spam".to_string(), folder.full_path.clone());
        }
    }

    map
}

fn canonical_from_flags(attributes: &[String]) -> Option<&'static str> {
    for attr in attributes {
        match attr.as_str() {
            "\\Sent" => return Some("Sent"),
            "\\Drafts" => return Some("Drafts"),
            "\\Trash" => return Some("Trash"),
            "\\Junk" => return Some("Spam"),
            _ => {}
        }
    }
    None
}

fn matches_by_name(canonical: &str, name: &str) -> bool {
    let lower = name.to_lowercase();
    match canonical {
        "Sent" => lower.contains("sent"),
        "Drafts" => lower.contains("draft"),
        "Trash" => lower.contains("trash") || lower.contains("bin") || lower.contains("deleted"),
        "Spam" => lower.contains("spam") || lower.contains("junk"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(name: &str, attrs: &[&str]) -> Folder {
        Folder {
            name: name.to_string(),
            delimiter: Some("/".to_string()),
            full_path: name.to_string(),
            parent: None,
            children: Vec::new(),
            selectable: true,
            attributes: attrs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn maps_by_special_use_flag() {
        let folders = vec![folder("Gesendet", &["\\Sent"])];
        let map = build_map(&folders);
        assert_eq!(map.get("Sent"), Some(&"Gesendet".to_string()));
    }

    #[test]
    fn falls_back_to_name_matching() {
        let folders = vec![folder("Deleted Items", &[])];
        let map = build_map(&folders);
        assert_eq!(map.get("Trash"), Some(&"Deleted Items".to_string()));
    }

    #[test]
    fn accepts_bin_as_trash_alias() {
        let folders = vec![folder("Recycle Bin", &[])];
        let map = build_map(&folders);
        assert_eq!(map.get("Trash"), Some(&"Recycle Bin".to_string()));
    }

    #[test]
    fn inbox_always_maps_to_inbox() {
        let map = build_map(&[]);
        assert_eq!(map.get("Inbox"), Some(&"INBOX".to_string()));
    }
}
