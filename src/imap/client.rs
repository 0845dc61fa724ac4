// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt::Debug, net::ToSocketAddrs, sync::Arc, time::Duration};

use log::info;
use native_tls::TlsConnector;
use tokio::net::TcpStream as TokioTcpStream;
use tokio_native_tls::TlsConnector as TokioTlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::imap::{
    error::ImapError,
    session::{AsyncImapOps, AsyncImapSessionWrapper},
};

use async_imap::Client as AsyncImapInternalClient;

/// Implicit TLS is used on this port; every other port STARTTLSes after a plaintext greeting.
pub const IMPLICIT_TLS_PORT: u16 = 993;

/// High-level IMAP client providing a simplified interface for common operations.
#[derive(Debug, Clone)]
pub struct ImapClient<T: AsyncImapOps + Send + Sync + Debug + 'static> {
    session: Arc<T>,
}

impl<T: AsyncImapOps + Send + Sync + Debug + 'static> ImapClient<T> {
    pub fn new(session: T) -> Self {
        Self { session: Arc::new(session) }
    }

    /// Establishes a new IMAP connection, choosing implicit TLS or STARTTLS by port (§4.3).
    pub async fn connect(server: &str, port: u16, username: &str, password: &str) -> Result<ImapClient<AsyncImapSessionWrapper>, ImapError> {
        Self::connect_with_append_timeout(server, port, username, password, Duration::from_secs(35)).await
    }

    pub async fn connect_with_append_timeout(
        server: &str,
        port: u16,
        username: &str,
        password: &str,
        append_timeout: Duration,
    ) -> Result<ImapClient<AsyncImapSessionWrapper>, ImapError> {
        let session = AsyncImapSessionWrapper::connect(
            server,
            port,
            Arc::new(username.to_string()),
            Arc::new(password.to_string()),
            append_timeout,
        ).await?;
        Ok(ImapClient::new(session))
    }

    pub fn session(&self) -> &T {
        &self.session
    }

    pub fn session_arc(&self) -> Arc<T> {
        self.session.clone()
    }

    pub async fn list_folders(&self) -> Result<Vec<String>, ImapError> {
        self.session.list_folders().await
    }

    pub async fn list_folders_hierarchical(&self) -> Result<Vec<crate::imap::types::Folder>, ImapError> {
        self.session.list_folders_hierarchical().await
    }

    pub async fn create_folder(&self, name: &str) -> Result<(), ImapError> {
        self.session.create_folder(name).await
    }

    pub async fn select_folder(&self, name: &str) -> Result<(), ImapError> {
        self.session.select_folder(name).await
    }

    pub async fn search_emails_structured(&self, criteria: &crate::imap::types::SearchCriteria) -> Result<Vec<u32>, ImapError> {
        self.session.search_emails_structured(criteria).await
    }

    pub async fn fetch_emails(&self, uids: &[u32]) -> Result<Vec<crate::imap::types::Email>, ImapError> {
        self.session.fetch_emails(uids).await
    }

    pub async fn move_email(&self, uid: u32, from_folder: &str, to_folder: &str) -> Result<(), ImapError> {
        self.session.move_email(uid, from_folder, to_folder).await
    }

    pub async fn store_flags(&self, uids: &[u32], operation: crate::imap::types::FlagOperation, flags: &[String]) -> Result<(), ImapError> {
        self.session.store_flags(uids, operation, flags).await
    }

    pub async fn append(&self, folder: &str, content: &[u8], flags: &[String]) -> Result<(), ImapError> {
        self.session.append(folder, content, flags).await
    }

    pub async fn fetch_raw_message(&self, uid: u32) -> Result<Vec<u8>, ImapError> {
        self.session.fetch_raw_message(uid).await
    }

    pub async fn expunge(&self) -> Result<(), ImapError> {
        self.session.expunge().await
    }

    pub async fn mark_as_deleted(&self, uids: &[u32]) -> Result<(), ImapError> {
        self.session.mark_as_deleted(uids).await
    }

    pub async fn noop(&self) -> Result<(), ImapError> {
        self.session.noop().await
    }

    pub async fn logout(&self) -> Result<(), ImapError> {
        self.session.logout().await
    }
}

/// Establishes a TLS-encrypted IMAP connection: implicit TLS on 993, STARTTLS otherwise.
pub async fn connect(
    server: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<ImapClient<AsyncImapSessionWrapper>, ImapError> {
    let addr = (server, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ImapError::Connection("Invalid server address".to_string()))?;

    let append_timeout_seconds = std::env::var("IMAP_APPEND_TIMEOUT_SECONDS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(35);
    let append_timeout = Duration::from_secs(append_timeout_seconds);

    info!("Connecting to IMAP server: {} (port {}) with socket timeout: {:?}", addr, port, append_timeout);

    let tcp_stream = tokio::time::timeout(timeout, TokioTcpStream::connect(addr))
        .await
        .map_err(|_| ImapError::Timeout("Connection timed out".to_string()))??;

    tcp_stream.set_nodelay(true)
        .map_err(|e| ImapError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

    let std_stream = tcp_stream.into_std()
        .map_err(|e| ImapError::Connection(format!("Failed to convert to std stream: {}", e)))?;
    std_stream.set_read_timeout(Some(append_timeout))
        .map_err(|e| ImapError::Connection(format!("Failed to set read timeout: {}", e)))?;
    std_stream.set_write_timeout(Some(append_timeout))
        .map_err(|e| ImapError::Connection(format!("Failed to set write timeout: {}", e)))?;
    let tcp_stream = TokioTcpStream::from_std(std_stream)
        .map_err(|e| ImapError::Connection(format!("Failed to convert back to tokio stream: {}", e)))?;

    let tls_builder = TlsConnector::builder();
    let native_tls_connector = tls_builder.build()
        .map_err(|e| ImapError::Tls(format!("Failed to build TLS connector: {}", e)))?;
    let tls_connector = TokioTlsConnector::from(native_tls_connector);

    let authenticated_session = if port == IMPLICIT_TLS_PORT {
        let tls_stream = tokio::time::timeout(timeout, tls_connector.connect(server, tcp_stream))
            .await
            .map_err(|_| ImapError::Timeout("TLS handshake timed out".to_string()))?
            .map_err(|e| ImapError::Tls(e.to_string()))?;
        info!("Implicit TLS connection established");

        let unauthenticated_session = AsyncImapInternalClient::new(tls_stream.compat());
        tokio::time::timeout(timeout, unauthenticated_session.login(username, password))
            .await
            .map_err(|_| ImapError::Timeout("Login timed out".to_string()))?
            .map_err(|(err, _client)| ImapError::from(err))?
    } else {
        // Plaintext greeting, then STARTTLS before login.
        let plaintext_client = AsyncImapInternalClient::new(tcp_stream.compat());
        let greeted = tokio::time::timeout(timeout, plaintext_client.read_greeting())
            .await
            .map_err(|_| ImapError::Timeout("Greeting timed out".to_string()))?
            .map_err(ImapError::from)?;
        let (_greeting, plaintext_client) = greeted;

        let tls_stream = tokio::time::timeout(timeout, plaintext_client.secure(server, &tls_connector))
            .await
            .map_err(|_| ImapError::Timeout("STARTTLS timed out".to_string()))?
            .map_err(ImapError::from)?;
        info!("STARTTLS connection established");

        tokio::time::timeout(timeout, tls_stream.login(username, password))
            .await
            .map_err(|_| ImapError::Timeout("Login timed out".to_string()))?
            .map_err(|(err, _client)| ImapError::from(err))?
    };

    info!("IMAP login successful for user: {}", username);

    let wrapped_session = AsyncImapSessionWrapper::with_append_timeout(authenticated_session, append_timeout);
    Ok(ImapClient::new(wrapped_session))
}
