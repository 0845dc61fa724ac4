// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Library core for the mail bridge.

pub mod attachments;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod domain;
pub mod draft_uplink;
pub mod engine;
pub mod error;
pub mod folder_mapper;
pub mod imap;
pub mod job_queue;
pub mod mutation;
pub mod read_path;
pub mod session_pool;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod worker;

pub mod prelude {
    pub use crate::attachments::{AttachmentError, AttachmentStore};
    pub use crate::cache::HotCache;
    pub use crate::config::Settings;
    pub use crate::domain::{
        Attachment, Category, ClassificationRule, Job, Label, Message, MessageId, RuleType,
        Source, UserConfig,
    };
    pub use crate::engine::Engine;
    pub use crate::error::BridgeError;
    pub use crate::read_path::ReadPath;
    pub use crate::imap::{
        Address, CloneableImapSessionFactory, Email, Envelope, FlagOperation, Flags, Folder,
        ImapClient, ImapError, SearchCriteria,
    };

    pub use log::{debug, error, info, trace, warn};
    pub use thiserror::Error;
    pub use uuid::Uuid;
}
