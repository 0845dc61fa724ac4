// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Flat keyed byte store for downloaded attachment bodies (§4.6). Filenames
//! are never trusted as path components; every blob lives under a single
//! generated key inside the storage root.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::warn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("path traversal attempt detected")]
    PathTraversal,
    #[error("attachment not found: {0}")]
    NotFound(String),
}

/// Rejects path traversal patterns outright rather than silently
/// sanitizing them: a fail-closed filename check.
pub fn sanitize_filename(filename: &str) -> Result<String, AttachmentError> {
    if filename.contains('\0') {
        warn!("attachment filename contains a null byte");
        return Err(AttachmentError::InvalidFilename("null byte in filename".to_string()));
    }
    if filename.contains("..") {
        warn!("attachment filename contains '..'");
        return Err(AttachmentError::PathTraversal);
    }
    if filename.contains('/') || filename.contains('\\') {
        warn!("attachment filename contains a path separator");
        return Err(AttachmentError::PathTraversal);
    }
    if filename.is_empty() || filename == "." {
        return Err(AttachmentError::InvalidFilename("empty filename".to_string()));
    }
    let sanitized: String = filename.chars().map(|c| if c == ':' { '_' } else { c }).collect();
    Ok(sanitized.chars().take(255).collect())
}

/// Builds the unique `<ts>-<rand>-<sanitized_name>` blob key (§4.6).
pub fn make_key(original_filename: &str) -> Result<String, AttachmentError> {
    let safe = sanitize_filename(original_filename)?;
    let ts = Utc::now().timestamp_millis();
    let rand_part: u32 = rand::random();
    Ok(format!("{}-{:08x}-{}", ts, rand_part, safe))
}

pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AttachmentError> {
        if key.contains("..") || key.contains('/') || key.contains('\\') || key.is_empty() {
            return Err(AttachmentError::PathTraversal);
        }
        Ok(self.root.join(key))
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), AttachmentError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>, AttachmentError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AttachmentError::NotFound(key.to_string())
            } else {
                AttachmentError::Io(e)
            }
        })
    }

    pub async fn delete(&self, key: &str) -> Result<(), AttachmentError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AttachmentError::Io(e)),
        }
    }

    #[cfg(test)]
    fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_filename("../secret.txt").is_err());
        assert!(sanitize_filename("a/b.txt").is_err());
        assert!(sanitize_filename("file\0.txt").is_err());
        assert!(sanitize_filename("").is_err());
    }

    #[test]
    fn sanitize_accepts_normal_names() {
        assert_eq!(sanitize_filename("invoice.pdf").unwrap(), "invoice.pdf");
    }

    #[test]
    fn make_key_embeds_sanitized_name() {
        let key = make_key("report.pdf").unwrap();
        assert!(key.ends_with("-report.pdf"));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        store.write("k1", b"hello").await.unwrap();
        let bytes = store.read("k1").await.unwrap();
        assert_eq!(bytes, b"hello");
        assert!(store.root().join("k1").exists());
    }

    #[tokio::test]
    async fn read_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        let err = store.read("missing").await.unwrap_err();
        assert!(matches!(err, AttachmentError::NotFound(_)));
    }
}
