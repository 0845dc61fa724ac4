// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Applies user-initiated mutations optimistically to local state, then
//! asynchronously to the remote mailbox (§4.9). A failed remote-side effect
//! never rolls back the local write; the next full sync reconciles it.

use std::sync::Arc;

use lettre::message::header::ContentType as LettreContentType;
use lettre::message::{Attachment as LettreAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use log::warn;
use tokio::task::JoinHandle;

use crate::attachments::AttachmentStore;
use crate::cache::HotCache;
use crate::classifier;
use crate::domain::{Attachment, Category, ClassificationRule, Message, MessageId, RuleType};
use crate::error::BridgeError;
use crate::imap::types::FlagOperation;
use crate::session_pool::SessionPool;
use crate::storage::Storage;

pub struct MutationExecutor {
    storage: Arc<Storage>,
    cache: Arc<HotCache>,
    pool: Arc<SessionPool>,
    attachments: Arc<AttachmentStore>,
}

impl MutationExecutor {
    pub fn new(
        storage: Arc<Storage>,
        cache: Arc<HotCache>,
        pool: Arc<SessionPool>,
        attachments: Arc<AttachmentStore>,
    ) -> Self {
        Self { storage, cache, pool, attachments }
    }

    /// Flips `read`, invalidates caches, then asynchronously stores the
    /// matching flag on the remote folder (§4.9).
    pub async fn set_read(&self, user: &str, id: &str, read: bool) -> Result<(), BridgeError> {
        let mut msg = self.require_message(user, id).await?;
        msg.read = read;
        self.storage.upsert_message(&msg).await?;
        self.cache.invalidate_message(user, id, &msg.folder);

        let (uid, folder) = MessageId::parse(id)?;
        self.spawn_remote(user, move |pool, user| async move {
            let op = if read { FlagOperation::Add } else { FlagOperation::Remove };
            pool.with_folder(&user, &folder, |client| async move {
                client.store_flags(&[uid], op, &["\\Seen".to_string()]).await
            })
            .await
        });
        Ok(())
    }

    /// Moves a message to a different folder, locally and then remotely (§4.9).
    pub async fn move_to_folder(
        &self,
        user: &str,
        id: &str,
        target_folder: &str,
    ) -> Result<(), BridgeError> {
        let mut msg = self.require_message(user, id).await?;
        let source_folder = msg.folder.clone();
        msg.folder = target_folder.to_string();
        self.storage.upsert_message(&msg).await?;
        self.cache.invalidate_message(user, id, &source_folder);
        self.cache.remove_prefix(&HotCache::list_prefix(user, target_folder));

        let (uid, from_folder) = MessageId::parse(id)?;
        let to_folder = target_folder.to_string();
        self.spawn_remote(user, move |pool, user| async move {
            pool.with_folder(&user, &from_folder, |client| {
                let to_folder = to_folder.clone();
                async move { client.move_email(uid, &from_folder, &to_folder).await }
            })
            .await
        });
        Ok(())
    }

    /// Reassigns a message's smart-tab category, then learns a rule and
    /// back-fills every Inbox message from the same sender (§4.8/§4.9). No
    /// remote effect.
    pub async fn move_to_category(
        &self,
        user: &str,
        id: &str,
        category: Category,
    ) -> Result<(), BridgeError> {
        let msg = self.require_message(user, id).await?;
        self.storage.set_category(user, id, category).await?;
        self.cache.invalidate_inbox_categories(user);
        self.cache.remove(&HotCache::mail_obj_key(user, id));

        let learn_key = classifier::learning_key_for_sender(&msg.from_address);
        self.storage
            .upsert_rule(&ClassificationRule {
                user: user.to_string(),
                category,
                rule_type: RuleType::From,
                value: learn_key.clone(),
            })
            .await?;
        self.cache.remove(&HotCache::smart_rules_key(user));

        for mut sibling in self.storage.inbox_messages_from(user, &learn_key).await? {
            if sibling.id == id {
                continue;
            }
            sibling.category = Some(category);
            self.storage.upsert_message(&sibling).await?;
        }
        self.cache.invalidate_inbox_categories(user);
        Ok(())
    }

    /// From Trash/Spam/Drafts, permanently deletes; otherwise moves to
    /// Trash (§4.9).
    pub async fn delete(&self, user: &str, id: &str, trash_folder: &str) -> Result<(), BridgeError> {
        let msg = self.require_message(user, id).await?;
        let permanent = matches!(msg.folder.as_str(), "Trash" | "Spam" | "Drafts");

        if permanent {
            self.storage.delete_message(user, id).await?;
            self.cache.invalidate_message(user, id, &msg.folder);

            let (uid, folder) = MessageId::parse(id)?;
            self.spawn_remote(user, move |pool, user| async move {
                pool.with_folder(&user, &folder, |client| async move {
                    client.mark_as_deleted(&[uid]).await?;
                    client.expunge().await
                })
                .await
            });
            Ok(())
        } else {
            self.move_to_folder(user, id, trash_folder).await
        }
    }

    /// Adds or removes a label from a message's local label set. No remote
    /// effect (§4.9).
    pub async fn set_label(
        &self,
        user: &str,
        id: &str,
        label: &str,
        present: bool,
    ) -> Result<(), BridgeError> {
        let mut msg = self.require_message(user, id).await?;
        msg.labels.retain(|l| l != label);
        if present {
            msg.labels.push(label.to_string());
        }
        self.storage.upsert_message(&msg).await?;
        self.cache.invalidate_message(user, id, &msg.folder);
        Ok(())
    }

    /// Sends a Drafts-folder message over SMTP submission, removes it from
    /// Drafts locally, and best-effort replicates the expunge/append remotely
    /// (§4.9). The local delete is synchronous, so the draft stops appearing
    /// in any subsequent read of local state the moment `send` returns.
    pub async fn send(&self, user: &str, id: &str, sent_folder: &str) -> Result<(), BridgeError> {
        let msg = self.require_message(user, id).await?;
        let cfg = self
            .storage
            .get_user_config(user)
            .await?
            .ok_or_else(|| BridgeError::AuthRequired(format!("no submission config for {}", user)))?;

        let mut attachment_bytes = Vec::with_capacity(msg.attachments.len());
        for att in &msg.attachments {
            let bytes = self.attachments.read(&att.blob_key).await.map_err(|e| {
                BridgeError::ValidationError(format!("attachment {} unreadable: {}", att.blob_key, e))
            })?;
            attachment_bytes.push((att.clone(), bytes));
        }

        let email = build_outgoing_email(&cfg.remote_user, &msg, &attachment_bytes)?;

        let creds = Credentials::new(cfg.remote_user.clone(), cfg.remote_pass.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.submission_host)
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?
            .port(cfg.submission_port)
            .credentials(creds)
            .build();

        mailer.send(email.clone()).await.map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;
        let raw = email.formatted();

        self.storage.delete_message(user, id).await?;
        self.cache.invalidate_message(user, id, &msg.folder);

        let (uid, draft_folder) = MessageId::parse(id)?;
        let to_folder = sent_folder.to_string();
        self.spawn_remote(user, move |pool, user| async move {
            pool.with_folder(&user, &draft_folder, |client| async move {
                client.mark_as_deleted(&[uid]).await?;
                client.expunge().await
            })
            .await
            .ok();

            let append_folder = to_folder.clone();
            pool.with_folder(&user, &to_folder, move |client| {
                let raw = raw.clone();
                async move { client.append(&append_folder, &raw, &[]).await }
            })
            .await
        });
        Ok(())
    }

    async fn require_message(
        &self,
        user: &str,
        id: &str,
    ) -> Result<crate::domain::Message, BridgeError> {
        self.storage
            .get_message(user, id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))
    }

    /// Fires the remote-side effect on its own task; failure is logged and
    /// otherwise swallowed (§4.9 failure policy).
    fn spawn_remote<F, Fut>(&self, user: &str, f: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<SessionPool>, String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), crate::session_pool::PoolError>> + Send,
    {
        let pool = self.pool.clone();
        let user = user.to_string();
        tokio::spawn(async move {
            if let Err(e) = f(pool, user.clone()).await {
                warn!("remote mutation effect failed for {}: {}", user, e);
            }
        })
    }
}

/// Builds the outgoing `lettre::Message` for a draft: plain-text body plus
/// any attachments as a `multipart/mixed` tree. Pure and network-free.
fn build_outgoing_email(
    from: &str,
    msg: &Message,
    attachment_bytes: &[(Attachment, Vec<u8>)],
) -> Result<LettreMessage, BridgeError> {
    let from_mailbox: Mailbox = from
        .parse()
        .map_err(|e| BridgeError::ValidationError(format!("invalid from address {}: {}", from, e)))?;

    let mut builder = LettreMessage::builder().from(from_mailbox).subject(&msg.subject);
    for to in &msg.to_addresses {
        builder = builder
            .to(to.parse().map_err(|e| {
                BridgeError::ValidationError(format!("invalid to address {}: {}", to, e))
            })?);
    }

    if attachment_bytes.is_empty() {
        builder
            .header(LettreContentType::TEXT_PLAIN)
            .body(msg.body.clone())
            .map_err(|e| BridgeError::ValidationError(format!("failed to build outgoing email: {}", e)))
    } else {
        let mut multipart = MultiPart::mixed()
            .singlepart(SinglePart::builder().header(LettreContentType::TEXT_PLAIN).body(msg.body.clone()));
        for (att, bytes) in attachment_bytes {
            let content_type = att.mime_type.parse().unwrap_or(LettreContentType::TEXT_PLAIN);
            multipart = multipart
                .singlepart(LettreAttachment::new(att.filename.clone()).body(bytes.clone(), content_type));
        }
        builder
            .multipart(multipart)
            .map_err(|e| BridgeError::ValidationError(format!("failed to build outgoing email: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn temp_storage() -> Storage {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.into_temp_path();
        let url = format!("sqlite://{}?mode=rwc", path.display());
        std::mem::forget(path);
        Storage::connect(&url).await.unwrap()
    }

    fn executor(storage: Arc<Storage>) -> MutationExecutor {
        let cache = Arc::new(HotCache::new());
        let pool = Arc::new(SessionPool::new(Duration::from_secs(25), Duration::from_secs(30)));
        let attachments = Arc::new(AttachmentStore::new(tempfile::tempdir().unwrap().into_path()));
        MutationExecutor::new(storage, cache, pool, attachments)
    }

    fn envelope(uid: u32, folder: &str) -> Message {
        Message::new_envelope(
            "alice",
            uid,
            folder,
            "sender@example.com",
            None,
            vec!["alice@example.com".to_string()],
            "hello",
            1000 + uid as i64,
        )
    }

    #[tokio::test]
    async fn set_read_flips_local_flag() {
        let storage = Arc::new(temp_storage().await);
        storage.upsert_message(&envelope(1, "Inbox")).await.unwrap();
        let exec = executor(storage.clone());

        let id = MessageId::new(1, "Inbox").0;
        exec.set_read("alice", &id, true).await.unwrap();

        let msg = storage.get_message("alice", &id).await.unwrap().unwrap();
        assert!(msg.read);
    }

    #[tokio::test]
    async fn move_to_folder_updates_local_folder() {
        let storage = Arc::new(temp_storage().await);
        storage.upsert_message(&envelope(2, "Inbox")).await.unwrap();
        let exec = executor(storage.clone());

        let id = MessageId::new(2, "Inbox").0;
        exec.move_to_folder("alice", &id, "Trash").await.unwrap();

        let msg = storage.get_message("alice", &id).await.unwrap().unwrap();
        assert_eq!(msg.folder, "Trash");
    }

    #[tokio::test]
    async fn move_to_category_learns_a_rule_and_backfills_sender() {
        let storage = Arc::new(temp_storage().await);
        let first = envelope(3, "Inbox");
        let second = envelope(4, "Inbox");
        storage.upsert_message(&first).await.unwrap();
        storage.upsert_message(&second).await.unwrap();
        let exec = executor(storage.clone());

        exec.move_to_category("alice", &first.id, Category::Social).await.unwrap();

        let rules = storage.list_rules("alice").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].category, Category::Social);

        let sibling = storage.get_message("alice", &second.id).await.unwrap().unwrap();
        assert_eq!(sibling.category, Some(Category::Social));
    }

    #[tokio::test]
    async fn delete_from_trash_is_permanent() {
        let storage = Arc::new(temp_storage().await);
        storage.upsert_message(&envelope(5, "Trash")).await.unwrap();
        let exec = executor(storage.clone());

        let id = MessageId::new(5, "Trash").0;
        exec.delete("alice", &id, "Trash").await.unwrap();

        assert!(storage.get_message("alice", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_from_inbox_moves_to_trash_instead() {
        let storage = Arc::new(temp_storage().await);
        storage.upsert_message(&envelope(6, "Inbox")).await.unwrap();
        let exec = executor(storage.clone());

        let id = MessageId::new(6, "Inbox").0;
        exec.delete("alice", &id, "Trash").await.unwrap();

        let msg = storage.get_message("alice", &id).await.unwrap().unwrap();
        assert_eq!(msg.folder, "Trash");
    }

    #[tokio::test]
    async fn set_label_adds_and_removes() {
        let storage = Arc::new(temp_storage().await);
        storage.upsert_message(&envelope(7, "Inbox")).await.unwrap();
        let exec = executor(storage.clone());

        let id = MessageId::new(7, "Inbox").0;
        exec.set_label("alice", &id, "work", true).await.unwrap();
        let msg = storage.get_message("alice", &id).await.unwrap().unwrap();
        assert_eq!(msg.labels, vec!["work".to_string()]);

        exec.set_label("alice", &id, "work", false).await.unwrap();
        let msg = storage.get_message("alice", &id).await.unwrap().unwrap();
        assert!(msg.labels.is_empty());
    }

    #[tokio::test]
    async fn send_without_user_config_is_auth_required() {
        let storage = Arc::new(temp_storage().await);
        storage.upsert_message(&envelope(8, "Drafts")).await.unwrap();
        let exec = executor(storage.clone());

        let id = MessageId::new(8, "Drafts").0;
        let err = exec.send("alice", &id, "Sent").await.unwrap_err();
        assert!(matches!(err, BridgeError::AuthRequired(_)));
    }

    #[test]
    fn build_outgoing_email_without_attachments_is_plain_text() {
        let mut msg = envelope(9, "Drafts");
        msg.body = "hello there".to_string();
        let email = build_outgoing_email("me@example.com", &msg, &[]).unwrap();
        let raw = String::from_utf8_lossy(&email.formatted()).into_owned();
        assert!(raw.contains("hello there"));
        assert!(raw.to_lowercase().contains("content-type: text/plain"));
    }

    #[test]
    fn build_outgoing_email_with_attachments_uses_multipart() {
        let mut msg = envelope(10, "Drafts");
        msg.body = "see attached".to_string();
        let att = Attachment {
            filename: "a.txt".to_string(),
            blob_key: "k1".to_string(),
            size: 5,
            mime_type: "text/plain".to_string(),
            content_id: None,
        };
        let email = build_outgoing_email("me@example.com", &msg, &[(att, b"hello".to_vec())]).unwrap();
        let raw = String::from_utf8_lossy(&email.formatted()).into_owned();
        assert!(raw.to_lowercase().contains("multipart/mixed"));
        assert!(raw.contains("a.txt"));
    }

    #[test]
    fn build_outgoing_email_rejects_invalid_to_address() {
        let mut msg = envelope(11, "Drafts");
        msg.to_addresses = vec!["not-an-address".to_string()];
        assert!(build_outgoing_email("me@example.com", &msg, &[]).is_err());
    }
}
