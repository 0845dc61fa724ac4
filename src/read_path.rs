// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read path for a single message (§4.11): hot cache, then storage, then a
//! priority hydration job with a bounded poll for the fresh row.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::cache::HotCache;
use crate::domain::{Job, Message, MessageId, Source};
use crate::error::BridgeError;
use crate::job_queue::JobQueueRegistry;
use crate::storage::{now_ms, Storage};

const HOT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HOT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Resolves one message for a user, hydrating on demand if only the
/// envelope has synced so far.
pub struct ReadPath {
    storage: Arc<Storage>,
    cache: Arc<HotCache>,
    queues: Arc<JobQueueRegistry>,
}

impl ReadPath {
    pub fn new(storage: Arc<Storage>, cache: Arc<HotCache>, queues: Arc<JobQueueRegistry>) -> Self {
        Self { storage, cache, queues }
    }

    pub async fn read(&self, user: &str, id: &str) -> Result<(Message, Source), BridgeError> {
        let obj_key = HotCache::mail_obj_key(user, id);

        if let Some(message) = self.cache.get::<Message>(&obj_key) {
            if message.is_full_body {
                return Ok((message, Source::Hot));
            }
        }

        let row = self.storage.get_message(user, id).await?;
        if let Some(message) = &row {
            if message.is_full_body {
                self.cache.set(obj_key.clone(), message, crate::cache::MAIL_OBJ_TTL);
                return Ok((message.clone(), Source::Warm));
            }
        }

        let Some(envelope) = row else {
            return Err(BridgeError::NotFound(id.to_string()));
        };

        self.enqueue_hydration(user, id, &envelope)?;
        self.poll_for_fresh_row(user, id, &obj_key).await
    }

    fn enqueue_hydration(&self, user: &str, id: &str, envelope: &Message) -> Result<(), BridgeError> {
        let (uid, folder) = MessageId::parse(id)?;
        let queue = self
            .queues
            .handle_for(user)
            .ok_or_else(|| BridgeError::BridgeOffline(format!("no job queue for user {}", user)))?;
        queue.add(Job {
            id: id.to_string(),
            priority: Job::PRIORITY_FOREGROUND,
            added_at_ms: now_ms(),
            uid,
            folder,
            user: user.to_string(),
            attempts: 0,
        });
        debug!("enqueued foreground hydration for {} ({})", id, envelope.from_address);
        Ok(())
    }

    async fn poll_for_fresh_row(
        &self,
        user: &str,
        id: &str,
        obj_key: &str,
    ) -> Result<(Message, Source), BridgeError> {
        let deadline = tokio::time::Instant::now() + HOT_POLL_TIMEOUT;
        let mut next_storage_check = tokio::time::Instant::now() + STORAGE_POLL_INTERVAL;

        loop {
            if let Some(message) = self.cache.get::<Message>(obj_key) {
                if message.is_full_body {
                    return Ok((message, Source::Hot));
                }
            }

            if tokio::time::Instant::now() >= next_storage_check {
                if let Some(message) = self.storage.get_message(user, id).await? {
                    if message.is_full_body {
                        self.cache.set(obj_key.to_string(), &message, crate::cache::MAIL_OBJ_TTL);
                        return Ok((message, Source::Warm));
                    }
                }
                next_storage_check = tokio::time::Instant::now() + STORAGE_POLL_INTERVAL;
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BridgeError::FetchTimeout);
            }
            tokio::time::sleep(HOT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_storage() -> Storage {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.into_temp_path();
        let url = format!("sqlite://{}?mode=rwc", path.display());
        std::mem::forget(path);
        Storage::connect(&url).await.unwrap()
    }

    fn read_path(storage: Arc<Storage>) -> (ReadPath, Arc<JobQueueRegistry>) {
        let cache = Arc::new(HotCache::new());
        let queues = Arc::new(JobQueueRegistry::new());
        (ReadPath::new(storage, cache, queues.clone()), queues)
    }

    fn envelope(uid: u32, folder: &str, full: bool) -> Message {
        let mut msg = Message::new_envelope(
            "alice", uid, folder, "sender@example.com", Some("Sender".to_string()),
            vec!["alice@example.com".to_string()], "hello", 1000,
        );
        if full {
            msg.body = "full body".to_string();
            msg.is_full_body = true;
        }
        msg
    }

    #[tokio::test]
    async fn returns_hot_when_cache_already_has_full_body() {
        let storage = Arc::new(temp_storage().await);
        let (path, _queues) = read_path(storage.clone());
        let msg = envelope(1, "Inbox", true);
        storage.upsert_message(&msg).await.unwrap();
        path.cache.set(HotCache::mail_obj_key("alice", &msg.id), &msg, Duration::from_secs(60));

        let (resolved, source) = path.read("alice", &msg.id).await.unwrap();
        assert_eq!(source, Source::Hot);
        assert_eq!(resolved.body, "full body");
    }

    #[tokio::test]
    async fn returns_warm_and_primes_cache_when_only_storage_has_full_body() {
        let storage = Arc::new(temp_storage().await);
        let (path, _queues) = read_path(storage.clone());
        let msg = envelope(2, "Inbox", true);
        storage.upsert_message(&msg).await.unwrap();

        let (resolved, source) = path.read("alice", &msg.id).await.unwrap();
        assert_eq!(source, Source::Warm);
        assert_eq!(resolved.body, "full body");
        assert!(path.cache.get::<Message>(&HotCache::mail_obj_key("alice", &msg.id)).is_some());
    }

    #[tokio::test]
    async fn enqueues_a_foreground_job_when_only_the_envelope_is_synced() {
        let storage = Arc::new(temp_storage().await);
        let (path, queues) = read_path(storage.clone());
        let msg = envelope(3, "Inbox", false);
        storage.upsert_message(&msg).await.unwrap();
        let handle = queues.register_user("alice");

        let id = msg.id.clone();
        let storage_for_writer = storage.clone();
        let writer = tokio::spawn(async move {
            let job = handle.pop().await.unwrap();
            assert_eq!(job.priority, Job::PRIORITY_FOREGROUND);
            let mut full = envelope(3, "Inbox", true);
            full.id = job.id.clone();
            storage_for_writer.upsert_message(&full).await.unwrap();
        });

        let (resolved, source) = path.read("alice", &id).await.unwrap();
        assert_eq!(source, Source::Warm);
        assert!(resolved.is_full_body);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_if_hydration_never_lands() {
        let storage = Arc::new(temp_storage().await);
        let (path, queues) = read_path(storage.clone());
        let msg = envelope(4, "Inbox", false);
        storage.upsert_message(&msg).await.unwrap();
        // Nothing ever pops the job, so the row never gets hydrated.
        let _handle = queues.register_user("alice");

        let id = msg.id.clone();
        let task = tokio::spawn(async move { path.read("alice", &id).await });

        for _ in 0..30 {
            tokio::time::advance(Duration::from_millis(500)).await;
        }

        let result = task.await.unwrap();
        assert!(matches!(result, Err(BridgeError::FetchTimeout)));
    }

    #[tokio::test]
    async fn missing_id_returns_not_found() {
        let storage = Arc::new(temp_storage().await);
        let (path, _queues) = read_path(storage);
        let result = path.read("alice", "uid-999-Inbox").await;
        assert!(matches!(result, Err(BridgeError::NotFound(_))));
    }
}
