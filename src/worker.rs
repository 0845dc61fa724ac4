// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-user hydration worker swarm (§4.6): ten tasks draining the job
//! queue, fetching full bodies and attachments, priming the hot cache.

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use tokio::sync::broadcast;

use crate::attachments::{self, AttachmentStore};
use crate::cache::HotCache;
use crate::domain::{Attachment, Job, Message};
use crate::imap::types::{Address, Email, MimePart};
use crate::job_queue::JobQueueHandle;
use crate::session_pool::{PoolError, SessionPool};
use crate::storage::Storage;
use crate::utils::mime_decoder::decode_mime_header;

const IDLE_POLL: Duration = Duration::from_millis(250);
const PREVIEW_LEN: usize = 160;

lazy_static! {
    static ref IMG_SRC_RE: Regex = Regex::new(r#"src="https?://[^"]*""#).unwrap();
    static ref TAG_RE: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref SCRIPT_STYLE_RE: Regex =
        Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap();
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
}

/// One of ten workers sharing a user's session, queue, storage and cache.
pub struct Worker {
    user: String,
    pool: Arc<SessionPool>,
    queue: JobQueueHandle,
    storage: Arc<Storage>,
    cache: Arc<HotCache>,
    attachments: Arc<AttachmentStore>,
}

impl Worker {
    pub fn new(
        user: impl Into<String>,
        pool: Arc<SessionPool>,
        queue: JobQueueHandle,
        storage: Arc<Storage>,
        cache: Arc<HotCache>,
        attachments: Arc<AttachmentStore>,
    ) -> Self {
        Self { user: user.into(), pool, queue, storage, cache, attachments }
    }

    /// Runs until `shutdown` fires, honoring the process-wide `systemRunning`
    /// broadcast cancellation token (§5).
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("worker for {} draining and terminating", self.user);
                    return;
                }
                job = self.queue.pop() => {
                    match job {
                        Some(job) => self.process(job).await,
                        None => tokio::time::sleep(IDLE_POLL).await,
                    }
                }
            }
        }
    }

    async fn process(&self, job: Job) {
        let uid = job.uid;
        let folder = job.folder.clone();
        let result = self
            .pool
            .with_folder(&self.user, &folder, move |client| async move {
                client.fetch_emails(&[uid]).await
            })
            .await;

        match result {
            Ok(mut emails) => {
                if let Some(email) = emails.pop() {
                    if let Err(e) = self.hydrate(&job, email).await {
                        warn!("hydration failed for uid {} ({}): {}", uid, self.user, e);
                    }
                }
                self.queue.done(job.id);
            }
            Err(PoolError::Cooldown) => {
                self.queue.retry_after_failure(job);
            }
            Err(e) => {
                warn!("fetch failed for uid {} ({}): {}", uid, self.user, e);
                self.queue.retry_after_failure(job);
            }
        }
    }

    async fn hydrate(&self, job: &Job, email: Email) -> Result<(), crate::error::BridgeError> {
        let (from_address, from_name) = sender_of(&email);
        let to_addresses = recipients_of(&email);
        let subject = email
            .envelope
            .as_ref()
            .and_then(|e| e.subject.clone())
            .map(|s| decode_mime_header(&s))
            .unwrap_or_default();
        let timestamp_ms =
            email.internal_date.map(|d| d.timestamp_millis()).unwrap_or_default();

        let html = email.html_body.as_deref().map(rewrite_embedded_images);
        let best_part = html.clone().or_else(|| email.text_body.clone()).or_else(|| first_part_text(&email.mime_parts));
        let body = best_part.clone().unwrap_or_default();
        let preview = compute_preview(best_part.as_deref());

        let mut message = Message::new_envelope(
            self.user.clone(),
            email.uid,
            job.folder.clone(),
            from_address,
            from_name,
            to_addresses,
            subject,
            timestamp_ms,
        );
        message.body = body;
        message.preview = preview;
        message.is_full_body = true;
        message.read = email.flags.iter().any(|f| f.contains("Seen"));

        message.attachments = self.store_attachments(&email.attachments).await;

        self.storage.upsert_message(&message).await?;
        self.cache.invalidate_message(&self.user, &message.id, &message.folder);
        self.cache.set(HotCache::mail_obj_key(&self.user, &message.id), &message, crate::cache::MAIL_OBJ_TTL);
        Ok(())
    }

    async fn store_attachments(&self, parts: &[MimePart]) -> Vec<Attachment> {
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            let filename = part
                .content_disposition
                .as_ref()
                .and_then(|cd| cd.filename().cloned())
                .unwrap_or_else(|| format!("attachment.{}", part.content_type.sub_type));

            let key = match attachments::make_key(&filename) {
                Ok(k) => k,
                Err(e) => {
                    warn!("skipping attachment with unusable filename: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.attachments.write(&key, &part.body).await {
                warn!("failed to write attachment {}: {}", key, e);
                continue;
            }
            out.push(Attachment {
                filename,
                blob_key: key,
                size: part.body.len() as u64,
                mime_type: part.content_type.mime_type(),
                content_id: part.content_id.clone(),
            });
        }
        out
    }
}

fn address_str(addr: &Address) -> String {
    match (&addr.mailbox, &addr.host) {
        (Some(m), Some(h)) => format!("{}@{}", m, h),
        (Some(m), None) => m.clone(),
        _ => String::new(),
    }
}

fn sender_of(email: &Email) -> (String, Option<String>) {
    match email.envelope.as_ref().and_then(|e| e.from.first()) {
        Some(addr) => (address_str(addr), addr.name.as_deref().map(decode_mime_header)),
        None => (String::new(), None),
    }
}

fn recipients_of(email: &Email) -> Vec<String> {
    email
        .envelope
        .as_ref()
        .map(|e| e.to.iter().map(address_str).collect())
        .unwrap_or_default()
}

/// Rewrites `src="http(s)://…"` embedded images to the proxy path so the UI
/// never fetches third-party hosts directly (§4.6).
fn rewrite_embedded_images(html: &str) -> String {
    IMG_SRC_RE
        .replace_all(html, |caps: &regex::Captures| {
            let full = &caps[0];
            let url = &full[5..full.len() - 1];
            format!(r#"src="/api/v1/proxy/image?url={}""#, urlencoding::encode(url))
        })
        .into_owned()
}

/// Strips script/style blocks and tags, collapses whitespace, truncates to
/// 160 chars (§4.6). Derived from the same best body part `body` was built
/// from, not a separately-preferred source.
fn compute_preview(source: Option<&str>) -> String {
    let Some(source) = source else { return String::new() };
    let without_blocks = SCRIPT_STYLE_RE.replace_all(source, " ");
    let stripped = TAG_RE.replace_all(&without_blocks, " ").into_owned();
    let collapsed = WHITESPACE_RE.replace_all(stripped.trim(), " ").into_owned();
    collapsed.chars().take(PREVIEW_LEN).collect()
}

/// Last-resort body source when neither `text/html` nor `text/plain` was
/// populated: the raw bytes of MIME part 1 (§4.6).
fn first_part_text(parts: &[MimePart]) -> Option<String> {
    parts.first().map(|p| String::from_utf8_lossy(&p.body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_strips_tags_and_collapses_whitespace() {
        let html = "<div>Hello   <b>world</b>\n\n!</div><script>evil()</script>";
        let preview = compute_preview(Some(html));
        assert_eq!(preview, "Hello world !");
    }

    #[test]
    fn preview_truncates_to_160_chars() {
        let long = "a".repeat(500);
        let preview = compute_preview(Some(&long));
        assert_eq!(preview.chars().count(), PREVIEW_LEN);
    }

    #[test]
    fn preview_of_missing_source_is_empty() {
        assert_eq!(compute_preview(None), "");
    }

    #[test]
    fn first_part_text_reads_raw_bytes_of_first_part() {
        let parts = vec![MimePart {
            content_type: crate::imap::types::ContentType {
                main_type: "text".to_string(),
                sub_type: "plain".to_string(),
                parameters: Default::default(),
            },
            content_transfer_encoding: None,
            content_disposition: None,
            content_id: None,
            content_description: None,
            headers: Default::default(),
            body: b"raw part one".to_vec(),
            text_content: None,
            parts: Vec::new(),
        }];
        assert_eq!(first_part_text(&parts), Some("raw part one".to_string()));
    }

    #[test]
    fn first_part_text_of_empty_parts_is_none() {
        assert_eq!(first_part_text(&[]), None);
    }

    #[test]
    fn rewrite_points_embedded_images_at_proxy() {
        let html = r#"<img src="http://evil.example/x.png">"#;
        let rewritten = rewrite_embedded_images(html);
        assert!(rewritten.contains("/api/v1/proxy/image?url="));
        assert!(!rewritten.contains("evil.example"));
    }
}
