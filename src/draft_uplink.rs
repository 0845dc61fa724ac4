// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dedicated per-user task keeping the Drafts folder bidirectionally
//! consistent (§4.10). Grounded on the outbox worker's `Arc<Self>` /
//! `start(self: Arc<Self>)` / fixed-sleep loop shape, but bidirectional
//! where that worker is strictly outbound.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::attachments::AttachmentStore;
use crate::cache::HotCache;
use crate::domain::{Attachment, Message, MessageId};
use crate::error::BridgeError;
use crate::imap::types::SearchCriteria;
use crate::session_pool::SessionPool;
use crate::storage::Storage;
use crate::utils::mime_decoder::decode_mime_header;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DRAFT_HEADER: &str = "X-Mailboy-Draft-ID";

/// Content staged by the UI under `draft_stage:<user>:<clientDraftId>`
/// before the uplink picks it up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedDraft {
    pub client_draft_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub prior_remote_uid: Option<u32>,
}

pub struct DraftUplink {
    user: String,
    drafts_folder: String,
    pool: Arc<SessionPool>,
    storage: Arc<Storage>,
    cache: Arc<HotCache>,
    attachments: Arc<AttachmentStore>,
}

impl DraftUplink {
    pub fn new(
        user: impl Into<String>,
        drafts_folder: impl Into<String>,
        pool: Arc<SessionPool>,
        storage: Arc<Storage>,
        cache: Arc<HotCache>,
        attachments: Arc<AttachmentStore>,
    ) -> Self {
        Self {
            user: user.into(),
            drafts_folder: drafts_folder.into(),
            pool,
            storage,
            cache,
            attachments,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("draft uplink for {} terminating", self.user);
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if let Err(e) = self.tick().await {
                        warn!("draft uplink tick failed for {}: {}", self.user, e);
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<(), BridgeError> {
        let prefix = HotCache::draft_stage_prefix(&self.user);
        for key in self.cache.keys_with_prefix(&prefix) {
            let Some(staged) = self.cache.get::<StagedDraft>(&key) else { continue };
            if let Err(e) = self.upload_one(&staged).await {
                warn!("failed to upload staged draft {}: {}", staged.client_draft_id, e);
                continue;
            }
            self.cache.remove(&key);
        }
        self.reconcile().await
    }

    /// Step 2: delete any existing remote copy of this draft, compose and
    /// append the new one, then upsert the local row (§4.10).
    async fn upload_one(&self, staged: &StagedDraft) -> Result<(), BridgeError> {
        let folder = self.drafts_folder.clone();

        if let Some(prior_uid) = staged.prior_remote_uid {
            let folder = folder.clone();
            self.pool
                .with_folder(&self.user, &folder, move |client| async move {
                    client.mark_as_deleted(&[prior_uid]).await?;
                    client.expunge().await
                })
                .await
                .ok();
        } else {
            let folder = folder.clone();
            let marker = staged.client_draft_id.clone();
            // SearchCriteria has no HEADER primitive; TEXT approximates a
            // header search since the marker also appears nowhere else.
            let matches = self
                .pool
                .with_folder(&self.user, &folder, move |client| async move {
                    client.search_emails_structured(&SearchCriteria::Text(marker)).await
                })
                .await
                .unwrap_or_default();
            if !matches.is_empty() {
                let folder = folder.clone();
                self.pool
                    .with_folder(&self.user, &folder, move |client| async move {
                        client.mark_as_deleted(&matches).await?;
                        client.expunge().await
                    })
                    .await
                    .ok();
            }
        }

        let mut attachment_bytes = Vec::with_capacity(staged.attachments.len());
        for att in &staged.attachments {
            let bytes = self.attachments.read(&att.blob_key).await.map_err(|e| {
                BridgeError::ValidationError(format!("attachment {} unreadable: {}", att.blob_key, e))
            })?;
            attachment_bytes.push((att.clone(), bytes));
        }
        let mime = compose_mime(staged, &attachment_bytes);

        let folder = self.drafts_folder.clone();
        let append_folder = folder.clone();
        self.pool
            .with_folder(&self.user, &folder, move |client| {
                let mime = mime.clone();
                let folder = append_folder.clone();
                async move { client.append(&folder, &mime, &["\\Draft".to_string()]).await }
            })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;

        let marker = staged.client_draft_id.clone();
        let folder = self.drafts_folder.clone();
        let new_uid = self
            .pool
            .with_folder(&self.user, &folder, move |client| async move {
                client.search_emails_structured(&SearchCriteria::Text(marker)).await
            })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?
            .into_iter()
            .max()
            .ok_or_else(|| BridgeError::RemoteTransient("draft not found after append".into()))?;

        let mut message = Message::new_envelope(
            self.user.clone(),
            new_uid,
            self.drafts_folder.clone(),
            staged.from.clone(),
            None,
            staged.to.clone(),
            staged.subject.clone(),
            crate::storage::now_ms(),
        );
        message.body = staged.body.clone();
        message.preview = staged.body.chars().take(160).collect();
        message.is_full_body = true;
        message.attachments = staged.attachments.clone();
        self.storage.upsert_message(&message).await?;
        self.cache.invalidate_message(&self.user, &message.id, &message.folder);
        Ok(())
    }

    /// Step 3: reconcile local Drafts rows against what the server actually
    /// has, deleting orphans and hydrating anything missing locally (§4.10).
    async fn reconcile(&self) -> Result<(), BridgeError> {
        let folder = self.drafts_folder.clone();
        self.pool
            .with_folder(&self.user, &folder, |client| async move { client.noop().await })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;

        let folder = self.drafts_folder.clone();
        let remote_uids = self
            .pool
            .with_folder(&self.user, &folder, move |client| async move {
                client.search_emails_structured(&SearchCriteria::All).await
            })
            .await
            .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;

        let local_uids = self.storage.uids_in_folder(&self.user, &self.drafts_folder).await?;

        for uid in &local_uids {
            if !remote_uids.contains(uid) {
                let id = MessageId::new(*uid, &self.drafts_folder).0;
                self.storage.delete_message(&self.user, &id).await?;
                self.cache.invalidate_message(&self.user, &id, &self.drafts_folder);
            }
        }

        let missing: Vec<u32> =
            remote_uids.iter().copied().filter(|u| !local_uids.contains(u)).collect();
        if !missing.is_empty() {
            let folder = self.drafts_folder.clone();
            let emails = self
                .pool
                .with_folder(&self.user, &folder, move |client| async move {
                    client.fetch_emails(&missing).await
                })
                .await
                .map_err(|e| BridgeError::RemoteTransient(e.to_string()))?;

            for email in emails {
                let from = email
                    .envelope
                    .as_ref()
                    .and_then(|e| e.from.first())
                    .and_then(|a| a.mailbox.clone())
                    .unwrap_or_default();
                let subject = email
                    .envelope
                    .as_ref()
                    .and_then(|e| e.subject.clone())
                    .map(|s| decode_mime_header(&s))
                    .unwrap_or_default();
                let mut message = Message::new_envelope(
                    self.user.clone(),
                    email.uid,
                    self.drafts_folder.clone(),
                    from,
                    None,
                    Vec::new(),
                    subject,
                    email.internal_date.map(|d| d.timestamp_millis()).unwrap_or_default(),
                );
                message.body = email.text_body.or(email.html_body).unwrap_or_default();
                message.is_full_body = true;
                self.storage.upsert_message(&message).await?;
            }
            self.cache.remove_prefix(&HotCache::list_prefix(&self.user, &self.drafts_folder));
        }

        Ok(())
    }
}

/// Hand-composed RFC 5322 message: plain text body, the custom draft-id
/// header, and attachments as a `multipart/mixed` MIME tree.
fn compose_mime(staged: &StagedDraft, attachments: &[(Attachment, Vec<u8>)]) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("From: {}\r\n", staged.from));
    out.push_str(&format!("To: {}\r\n", staged.to.join(", ")));
    out.push_str(&format!("Subject: {}\r\n", staged.subject));
    out.push_str(&format!("{}: {}\r\n", DRAFT_HEADER, staged.client_draft_id));
    out.push_str("MIME-Version: 1.0\r\n");

    if attachments.is_empty() {
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.push_str(&staged.body);
    } else {
        let boundary = format!("mailboy-{}", Uuid::new_v4());
        out.push_str(&format!("Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n", boundary));
        out.push_str(&format!("--{}\r\n", boundary));
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.push_str(&staged.body);
        out.push_str("\r\n");
        for (att, bytes) in attachments {
            out.push_str(&format!("--{}\r\n", boundary));
            out.push_str(&format!("Content-Type: {}\r\n", att.mime_type));
            out.push_str("Content-Transfer-Encoding: base64\r\n");
            out.push_str(&format!("Content-Disposition: attachment; filename=\"{}\"\r\n\r\n", att.filename));
            out.push_str(&BASE64.encode(bytes));
            out.push_str("\r\n");
        }
        out.push_str(&format!("--{}--\r\n", boundary));
    }

    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_mime_without_attachments_is_plain_text() {
        let staged = StagedDraft {
            client_draft_id: "c1".to_string(),
            from: "me@example.com".to_string(),
            to: vec!["you@example.com".to_string()],
            subject: "Hi".to_string(),
            body: "hello there".to_string(),
            attachments: Vec::new(),
            prior_remote_uid: None,
        };
        let mime = String::from_utf8(compose_mime(&staged, &[])).unwrap();
        assert!(mime.contains("X-Mailboy-Draft-ID: c1"));
        assert!(mime.contains("text/plain"));
        assert!(mime.contains("hello there"));
    }

    #[test]
    fn compose_mime_with_attachments_uses_multipart() {
        let staged = StagedDraft {
            client_draft_id: "c2".to_string(),
            from: "me@example.com".to_string(),
            to: vec!["you@example.com".to_string()],
            subject: "Files".to_string(),
            body: "see attached".to_string(),
            attachments: vec![Attachment {
                filename: "a.txt".to_string(),
                blob_key: "k1".to_string(),
                size: 5,
                mime_type: "text/plain".to_string(),
                content_id: None,
            }],
            prior_remote_uid: None,
        };
        let mime = String::from_utf8(compose_mime(&staged, &[(staged.attachments[0].clone(), b"hello".to_vec())])).unwrap();
        assert!(mime.contains("multipart/mixed"));
        assert!(mime.contains("filename=\"a.txt\""));
        assert!(mime.contains(&BASE64.encode(b"hello")));
    }
}
