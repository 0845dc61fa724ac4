// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! One durable authenticated session per user against the remote mailbox host,
//! with mailbox-lock discipline and global overload backoff (§4.3).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;

use crate::imap::{AsyncImapOps, CloneableImapSessionFactory, ImapClient, ImapError};

#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("failed to create session: {0}")]
    ConnectionFailed(String),
    #[error("in backoff cooldown")]
    Cooldown,
}

impl From<ImapError> for PoolError {
    fn from(err: ImapError) -> Self {
        PoolError::ConnectionFailed(err.to_string())
    }
}

/// Single live session for one user, plus the mailbox-lock serializing folder
/// operations across every worker sharing it (§4.3).
struct UserSession {
    client: TokioMutex<Option<Arc<ImapClient<AsyncImapOpsSession>>>>,
    mailbox_lock: TokioMutex<()>,
    current_folder: TokioMutex<Option<String>>,
    last_activity: TokioMutex<Instant>,
    factory: CloneableImapSessionFactory,
}

/// Concrete session type produced by the factory; kept as a type alias so the
/// pool reads the same whether backed by the real or a fake session.
pub type AsyncImapOpsSession = crate::imap::AsyncImapSessionWrapper;

impl UserSession {
    fn new(factory: CloneableImapSessionFactory) -> Self {
        Self {
            client: TokioMutex::new(None),
            mailbox_lock: TokioMutex::new(()),
            current_folder: TokioMutex::new(None),
            last_activity: TokioMutex::new(Instant::now()),
            factory,
        }
    }

    async fn ensure_connected(&self) -> Result<Arc<ImapClient<AsyncImapOpsSession>>, PoolError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = self.factory.create_session().await.map_err(PoolError::from)?;
        let client = Arc::new(client);
        *guard = Some(client.clone());
        *self.current_folder.lock().await = None;
        Ok(client)
    }

    async fn drop_connection(&self) {
        let mut guard = self.client.lock().await;
        *guard = None;
        *self.current_folder.lock().await = None;
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

/// One live session per user, shared by that user's worker swarm and draft uplink.
pub struct SessionPool {
    sessions: DashMap<String, Arc<UserSession>>,
    /// Monotonic backoff deadline, shared process-wide (§4.3/§5). Stored as
    /// millis-since-pool-creation so it can live in an `AtomicI64`.
    backoff_until_ms: AtomicI64,
    started_at: Instant,
    idle_ping_interval: Duration,
    backoff_duration: Duration,
}

impl SessionPool {
    pub fn new(idle_ping_interval: Duration, backoff_duration: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            backoff_until_ms: AtomicI64::new(0),
            started_at: Instant::now(),
            idle_ping_interval,
            backoff_duration,
        }
    }

    fn now_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    /// True while the process-wide backoff deadline has not yet elapsed.
    pub fn in_backoff(&self) -> bool {
        self.now_ms() < self.backoff_until_ms.load(Ordering::SeqCst)
    }

    /// Enters global backoff for `backoff_duration` from now, per a
    /// RemoteOverloaded signal (§4.3/§8 property 7).
    pub fn enter_backoff(&self) {
        let deadline = self.now_ms() + self.backoff_duration.as_millis() as i64;
        self.backoff_until_ms.fetch_max(deadline, Ordering::SeqCst);
        warn!("remote overload signal received, entering backoff for {:?}", self.backoff_duration);
    }

    pub fn register_user(&self, user: &str, factory: CloneableImapSessionFactory) {
        self.sessions.entry(user.to_string()).or_insert_with(|| Arc::new(UserSession::new(factory)));
    }

    fn session_for(&self, user: &str) -> Option<Arc<UserSession>> {
        self.sessions.get(user).map(|s| s.clone())
    }

    /// Acquires the mailbox lock, ensures `folder` is selected (closing any other
    /// currently-open folder first), then runs `f` against the client. Releases
    /// the lock on every path, including failure (§4.3, §5, §9 `withFolder`).
    pub async fn with_folder<F, Fut, T>(
        &self,
        user: &str,
        folder: &str,
        f: F,
    ) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<ImapClient<AsyncImapOpsSession>>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ImapError>>,
    {
        if self.in_backoff() {
            return Err(PoolError::Cooldown);
        }

        let session = self.session_for(user).ok_or_else(|| {
            PoolError::ConnectionFailed(format!("no session registered for user {}", user))
        })?;

        let _mailbox_guard = session.mailbox_lock.lock().await;
        let client = session.ensure_connected().await?;
        session.touch().await;

        {
            let mut current = session.current_folder.lock().await;
            if current.as_deref() != Some(folder) {
                client.select_folder(folder).await.map_err(|e| {
                    PoolError::ConnectionFailed(e.to_string())
                })?;
                *current = Some(folder.to_string());
            }
        }

        match f(client).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_overload(&err) {
                    self.enter_backoff();
                }
                if is_transport_error(&err) {
                    debug!("transport error on user {}, dropping session for reconnect", user);
                    session.drop_connection().await;
                }
                Err(PoolError::ConnectionFailed(err.to_string()))
            }
        }
    }

    /// Runs `f` against the connected client without selecting any folder first.
    /// Used for folder-listing calls that don't operate on a selected mailbox.
    pub async fn with_session<F, Fut, T>(&self, user: &str, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<ImapClient<AsyncImapOpsSession>>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ImapError>>,
    {
        if self.in_backoff() {
            return Err(PoolError::Cooldown);
        }

        let session = self.session_for(user).ok_or_else(|| {
            PoolError::ConnectionFailed(format!("no session registered for user {}", user))
        })?;

        let _mailbox_guard = session.mailbox_lock.lock().await;
        let client = session.ensure_connected().await?;
        session.touch().await;

        match f(client).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_overload(&err) {
                    self.enter_backoff();
                }
                if is_transport_error(&err) {
                    session.drop_connection().await;
                }
                Err(PoolError::ConnectionFailed(err.to_string()))
            }
        }
    }

    /// Background task: pings every session idle for ≥ `idle_ping_interval` (§4.3/§4.6).
    pub async fn idle_ping_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.idle_ping_interval).await;
            for entry in self.sessions.iter() {
                let session = entry.value().clone();
                let idle_for = session.last_activity.lock().await.elapsed();
                if idle_for < self.idle_ping_interval {
                    continue;
                }
                let client = {
                    let guard = session.client.lock().await;
                    guard.clone()
                };
                if let Some(client) = client {
                    if client.noop().await.is_err() {
                        session.drop_connection().await;
                    } else {
                        session.touch().await;
                    }
                }
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().drop_connection().await;
        }
        info!("session pool: all sessions disconnected");
    }
}

fn is_overload(err: &ImapError) -> bool {
    matches!(err, ImapError::Command(msg) | ImapError::BadResponse(msg) if msg.to_lowercase().contains("too many"))
}

fn is_transport_error(err: &ImapError) -> bool {
    matches!(err, ImapError::Connection(_) | ImapError::Tls(_) | ImapError::Io(_) | ImapError::Timeout(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_inactive() {
        let pool = SessionPool::new(Duration::from_secs(25), Duration::from_secs(30));
        assert!(!pool.in_backoff());
    }

    #[test]
    fn entering_backoff_activates_cooldown() {
        let pool = SessionPool::new(Duration::from_secs(25), Duration::from_secs(30));
        pool.enter_backoff();
        assert!(pool.in_backoff());
    }
}
