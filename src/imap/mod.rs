// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Public interface for the IMAP transport module.

pub mod client;
pub mod error;
pub mod session;
pub mod types;

pub use client::ImapClient;
pub use error::ImapError;
pub use session::{AsyncImapOps, AsyncImapSessionWrapper};
pub use types::{
    Address, Email, Envelope, FlagOperation, Flags, Folder, MailboxInfo, SearchCriteria,
    AppendEmailPayload, ModifyFlagsPayload,
};

use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

pub type ImapSessionFactoryResult = Result<ImapClient<AsyncImapSessionWrapper>, ImapError>;
pub type ImapSessionFactory = Box<dyn Fn() -> BoxFuture<'static, ImapSessionFactoryResult> + Send + Sync>;

/// Cloneable session factory bound to one user's credentials, used by the session pool
/// and the worker swarm to (re)connect after a transport error.
#[derive(Clone)]
pub struct CloneableImapSessionFactory {
    factory: Arc<ImapSessionFactory>,
}

impl CloneableImapSessionFactory {
    pub fn new(factory: ImapSessionFactory) -> Self {
        Self { factory: Arc::new(factory) }
    }

    pub fn for_credentials(host: String, port: u16, user: String, pass: String) -> Self {
        Self::new(Box::new(move || {
            let host = host.clone();
            let user = user.clone();
            let pass = pass.clone();
            Box::pin(async move { ImapClient::<AsyncImapSessionWrapper>::connect(&host, port, &user, &pass).await })
        }))
    }

    pub fn create_session(&self) -> BoxFuture<'_, ImapSessionFactoryResult> {
        (self.factory)()
    }
}

impl fmt::Debug for CloneableImapSessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneableImapSessionFactory").field("factory", &"<function>").finish()
    }
}

unsafe impl Send for CloneableImapSessionFactory {}
unsafe impl Sync for CloneableImapSessionFactory {}
