// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single owned value aggregating every shared service and per-user task set
//! (Design Notes §9): construct services, spawn workers, hold `Arc`s
//! together, behind a plain struct rather than an HTTP-framework app state.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::broadcast;

use crate::attachments::AttachmentStore;
use crate::cache::HotCache;
use crate::config::Settings;
use crate::domain::{Category, Message, Source, UserConfig};
use crate::draft_uplink::DraftUplink;
use crate::error::BridgeError;
use crate::folder_mapper::FolderMapper;
use crate::imap::CloneableImapSessionFactory;
use crate::job_queue::JobQueueRegistry;
use crate::mutation::MutationExecutor;
use crate::read_path::ReadPath;
use crate::session_pool::SessionPool;
use crate::storage::Storage;
use crate::sync::{self, SyncOrchestrator};
use crate::worker::Worker;

const WORKERS_PER_USER: usize = 10;
const DRAFTS_FOLDER: &str = "Drafts";

pub struct Engine {
    pub storage: Arc<Storage>,
    pub cache: Arc<HotCache>,
    pub pool: Arc<SessionPool>,
    pub attachments: Arc<AttachmentStore>,
    pub queues: Arc<JobQueueRegistry>,
    pub mutations: Arc<MutationExecutor>,
    /// Flipped by dropping the sender; every spawned task holds a receiver
    /// and observes it at its next loop head (§5 "systemRunning").
    shutdown: broadcast::Sender<()>,
}

impl Engine {
    pub async fn new(settings: &Settings) -> Result<Self, BridgeError> {
        let storage = Arc::new(Storage::connect(&settings.storage.path).await?);
        let cache = Arc::new(HotCache::new());
        let pool = Arc::new(SessionPool::new(
            Duration::from_secs(25),
            Duration::from_secs(settings.worker.backoff_secs),
        ));
        let attachments_root =
            std::env::var("ATTACHMENTS_STORAGE_PATH").unwrap_or_else(|_| "attachments".to_string());
        let attachments = Arc::new(AttachmentStore::new(attachments_root));
        let queues = Arc::new(JobQueueRegistry::new());
        let mutations = Arc::new(MutationExecutor::new(
            storage.clone(),
            cache.clone(),
            pool.clone(),
            attachments.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self { storage, cache, pool, attachments, queues, mutations, shutdown })
    }

    /// Registers a user's remote credentials, then spawns their worker swarm,
    /// draft uplink, and periodic quick-sync timer (§4.6/§4.7/§4.10).
    pub async fn register_user(&self, cfg: &UserConfig) -> Result<(), BridgeError> {
        self.storage.upsert_user_config(cfg).await?;

        let factory = CloneableImapSessionFactory::for_credentials(
            cfg.remote_host.clone(),
            cfg.remote_port,
            cfg.remote_user.clone(),
            cfg.remote_pass.clone(),
        );
        self.pool.register_user(&cfg.user, factory);
        let queue = self.queues.register_user(&cfg.user);

        for _ in 0..WORKERS_PER_USER {
            let worker = Arc::new(Worker::new(
                cfg.user.clone(),
                self.pool.clone(),
                queue.clone(),
                self.storage.clone(),
                self.cache.clone(),
                self.attachments.clone(),
            ));
            tokio::spawn(worker.run(self.shutdown.subscribe()));
        }

        let uplink = Arc::new(DraftUplink::new(
            cfg.user.clone(),
            DRAFTS_FOLDER,
            self.pool.clone(),
            self.storage.clone(),
            self.cache.clone(),
            self.attachments.clone(),
        ));
        tokio::spawn(uplink.run(self.shutdown.subscribe()));

        let orchestrator = Arc::new(SyncOrchestrator::new(
            cfg.user.clone(),
            self.pool.clone(),
            self.storage.clone(),
            self.cache.clone(),
            queue,
        ));
        tokio::spawn(sync::run_periodic(
            orchestrator,
            self.cache.clone(),
            cfg.user.clone(),
            self.shutdown.subscribe(),
        ));

        info!("registered user {} ({} workers, draft uplink, sync timer)", cfg.user, WORKERS_PER_USER);
        Ok(())
    }

    /// Resolves one message, hydrating on demand and polling for the fresh
    /// row if only the envelope has synced so far (§4.11).
    pub async fn read_message(&self, user: &str, id: &str) -> Result<(Message, Source), BridgeError> {
        let read_path = ReadPath::new(self.storage.clone(), self.cache.clone(), self.queues.clone());
        read_path.read(user, id).await
    }

    /// Flips a message's read flag (§4.9).
    pub async fn set_read(&self, user: &str, id: &str, read: bool) -> Result<(), BridgeError> {
        self.mutations.set_read(user, id, read).await
    }

    /// Moves a message into the given canonical folder, resolving it to the
    /// server's real path first (§4.4/§4.9).
    pub async fn move_to_folder(
        &self,
        user: &str,
        id: &str,
        target_canonical_folder: &str,
    ) -> Result<(), BridgeError> {
        let target = self.resolve_folder(user, target_canonical_folder).await?;
        self.mutations.move_to_folder(user, id, &target).await
    }

    /// Reassigns a message's smart-tab category (§4.8/§4.9).
    pub async fn move_to_category(
        &self,
        user: &str,
        id: &str,
        category: Category,
    ) -> Result<(), BridgeError> {
        self.mutations.move_to_category(user, id, category).await
    }

    /// Deletes a message, resolving the canonical Trash folder for the
    /// non-permanent-delete case (§4.9).
    pub async fn delete(&self, user: &str, id: &str) -> Result<(), BridgeError> {
        let trash = self.resolve_folder(user, "Trash").await?;
        self.mutations.delete(user, id, &trash).await
    }

    /// Adds or removes a label from a message (§4.9).
    pub async fn set_label(
        &self,
        user: &str,
        id: &str,
        label: &str,
        present: bool,
    ) -> Result<(), BridgeError> {
        self.mutations.set_label(user, id, label, present).await
    }

    /// Sends a Drafts-folder message over SMTP submission, resolving the
    /// canonical Sent folder for the post-send append (§4.9).
    pub async fn send(&self, user: &str, id: &str) -> Result<(), BridgeError> {
        let sent = self.resolve_folder(user, "Sent").await?;
        self.mutations.send(user, id, &sent).await
    }

    /// Translates a canonical folder name (Inbox/Sent/Drafts/Trash/Spam) to
    /// its server path for the current folder listing (§4.4).
    async fn resolve_folder(&self, user: &str, canonical: &str) -> Result<String, BridgeError> {
        let folders = self
            .pool
            .with_session(user, |client| async move { client.list_folders_hierarchical().await })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;
        let map = FolderMapper::new(&self.cache).resolve(user, &folders).await;
        map.get(canonical)
            .cloned()
            .ok_or_else(|| BridgeError::ValidationError(format!("no server folder maps to {}", canonical)))
    }

    /// Spawns the idle-ping background loop shared by every registered session (§4.3).
    pub fn spawn_idle_ping(&self) {
        tokio::spawn(self.pool.clone().idle_ping_loop());
    }

    /// Flips `systemRunning` false; every worker, draft uplink, and sync
    /// timer observes it at its next loop head and returns (§5).
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.pool.disconnect_all().await;
    }
}
