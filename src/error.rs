// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Crate-wide error type for the bridge.

use thiserror::Error;

use crate::imap::error::ImapError;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// One flat enum covering every failure domain a caller can observe, per §7.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Credentials missing or rejected by the remote server.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Local storage or hot cache unreachable.
    #[error("bridge offline: {0}")]
    BridgeOffline(String),

    /// Transport reset or read timeout talking to the remote server.
    #[error("remote transient error: {0}")]
    RemoteTransient(String),

    /// Remote server reports too many simultaneous connections.
    #[error("remote overloaded: {0}")]
    RemoteOverloaded(String),

    /// Read-path poll exhausted without a fresh row appearing.
    #[error("fetch timed out waiting for hydration")]
    FetchTimeout,

    /// Requested id/uid absent both locally and on the remote.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request body or parameters.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Backing store unreachable at connect time.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}

impl BridgeError {
    /// Maps the error to the HTTP status code its wire-facing edge would use (§6/§7).
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::AuthRequired(_) => 401,
            BridgeError::BridgeOffline(_) => 503,
            BridgeError::RemoteTransient(_) => 502,
            BridgeError::RemoteOverloaded(_) => 503,
            BridgeError::FetchTimeout => 408,
            BridgeError::NotFound(_) => 404,
            BridgeError::ValidationError(_) => 400,
            BridgeError::PersistenceUnavailable(_) => 503,
        }
    }
}

impl From<ImapError> for BridgeError {
    fn from(err: ImapError) -> Self {
        match err {
            ImapError::Auth(msg) => BridgeError::AuthRequired(msg),
            ImapError::Timeout(msg) => BridgeError::RemoteTransient(msg),
            ImapError::Connection(msg) | ImapError::Tls(msg) | ImapError::Io(msg) => {
                BridgeError::RemoteTransient(msg)
            }
            ImapError::EmailNotFound(ids) => BridgeError::NotFound(ids),
            ImapError::FolderNotFound(folder) => BridgeError::NotFound(folder),
            ImapError::Validation(msg) | ImapError::InvalidCriteria(msg) => {
                BridgeError::ValidationError(msg)
            }
            other => BridgeError::RemoteTransient(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::PersistenceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_timeout_maps_to_408() {
        assert_eq!(BridgeError::FetchTimeout.http_status(), 408);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(BridgeError::NotFound("x".into()).http_status(), 404);
    }

    #[test]
    fn validation_error_maps_to_400() {
        assert_eq!(BridgeError::ValidationError("bad".into()).http_status(), 400);
    }

    #[test]
    fn overloaded_and_persistence_unavailable_map_to_503() {
        assert_eq!(BridgeError::RemoteOverloaded("x".into()).http_status(), 503);
        assert_eq!(BridgeError::PersistenceUnavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn imap_auth_error_converts_to_auth_required() {
        let imap_err = ImapError::Auth("bad password".to_string());
        let bridge_err: BridgeError = imap_err.into();
        assert!(matches!(bridge_err, BridgeError::AuthRequired(_)));
    }
}
