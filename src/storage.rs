// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Persistent document store for messages, user config, labels, and classification
//! rules (§4.1). SQLite via `sqlx`, with JSON-text columns for set-valued fields.

use chrono::Utc;
use log::info;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::domain::{
    Attachment, Category, ClassificationRule, Label, Message, RuleType, UserConfig,
};
use crate::error::BridgeError;

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Connects and runs migrations. Fails with `PersistenceUnavailable` if the
    /// backing store cannot be reached (fatal at startup per §4.1).
    pub async fn connect(database_url: &str) -> Result<Self, BridgeError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| BridgeError::PersistenceUnavailable(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| BridgeError::PersistenceUnavailable(e.to_string()))?;

        info!("storage layer connected: {}", database_url);
        Ok(Self { pool })
    }

    /// Upserts a message: `$set` semantics for mutable fields, `$setOnInsert` for
    /// the immutable envelope fields, per §4.1.
    pub async fn upsert_message(&self, msg: &Message) -> Result<(), BridgeError> {
        let labels = serde_json::to_string(&msg.labels).unwrap_or_else(|_| "[]".to_string());
        let attachments =
            serde_json::to_string(&msg.attachments).unwrap_or_else(|_| "[]".to_string());
        let to_addresses =
            serde_json::to_string(&msg.to_addresses).unwrap_or_else(|_| "[]".to_string());
        let category = msg.category.map(|c| c.as_str().to_string());

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, uid, user, from_address, from_name, to_addresses, subject,
                timestamp_ms, body, preview, is_full_body, read, folder, labels,
                category, attachments
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                preview = excluded.preview,
                is_full_body = excluded.is_full_body,
                read = excluded.read,
                folder = excluded.folder,
                labels = excluded.labels,
                category = excluded.category,
                attachments = excluded.attachments
            "#,
        )
        .bind(&msg.id)
        .bind(msg.uid as i64)
        .bind(&msg.user)
        .bind(&msg.from_address)
        .bind(&msg.from_name)
        .bind(to_addresses)
        .bind(&msg.subject)
        .bind(msg.timestamp_ms)
        .bind(&msg.body)
        .bind(&msg.preview)
        .bind(msg.is_full_body)
        .bind(msg.read)
        .bind(&msg.folder)
        .bind(labels)
        .bind(category)
        .bind(attachments)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_message(&self, user: &str, id: &str) -> Result<Option<Message>, BridgeError> {
        let row = sqlx::query(
            r#"SELECT id, uid, user, from_address, from_name, to_addresses, subject,
                      timestamp_ms, body, preview, is_full_body, read, folder, labels,
                      category, attachments
               FROM messages WHERE user = ? AND id = ?"#,
        )
        .bind(user)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).transpose()
    }

    /// `isFullBody` field-projection check, used by the read path (§4.11).
    pub async fn is_full_body(&self, user: &str, id: &str) -> Result<Option<bool>, BridgeError> {
        let row = sqlx::query("SELECT is_full_body FROM messages WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<bool, _>("is_full_body")))
    }

    /// `(user, folder) ORDER BY timestamp DESC LIMIT 100` range query (§4.1).
    pub async fn list_messages(
        &self,
        user: &str,
        folder: &str,
        category: Option<Category>,
    ) -> Result<Vec<Message>, BridgeError> {
        let rows = if let Some(category) = category {
            sqlx::query(
                r#"SELECT id, uid, user, from_address, from_name, to_addresses, subject,
                          timestamp_ms, body, preview, is_full_body, read, folder, labels,
                          category, attachments
                   FROM messages WHERE user = ? AND folder = ? AND category = ?
                   ORDER BY timestamp_ms DESC LIMIT 100"#,
            )
            .bind(user)
            .bind(folder)
            .bind(category.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"SELECT id, uid, user, from_address, from_name, to_addresses, subject,
                          timestamp_ms, body, preview, is_full_body, read, folder, labels,
                          category, attachments
                   FROM messages WHERE user = ? AND folder = ?
                   ORDER BY timestamp_ms DESC LIMIT 100"#,
            )
            .bind(user)
            .bind(folder)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn delete_message(&self, user: &str, id: &str) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM messages WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every Inbox message from the given sender address, used by the classifier's
    /// learning step (§4.8).
    pub async fn inbox_messages_from(
        &self,
        user: &str,
        from_address: &str,
    ) -> Result<Vec<Message>, BridgeError> {
        let rows = sqlx::query(
            r#"SELECT id, uid, user, from_address, from_name, to_addresses, subject,
                      timestamp_ms, body, preview, is_full_body, read, folder, labels,
                      category, attachments
               FROM messages WHERE user = ? AND folder = 'Inbox' AND LOWER(from_address) LIKE ?"#,
        )
        .bind(user)
        .bind(format!("%{}", from_address.to_lowercase()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn set_category(
        &self,
        user: &str,
        id: &str,
        category: Category,
    ) -> Result<(), BridgeError> {
        sqlx::query("UPDATE messages SET category = ? WHERE user = ? AND id = ?")
            .bind(category.as_str())
            .bind(user)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_user_config(&self, cfg: &UserConfig) -> Result<(), BridgeError> {
        sqlx::query(
            r#"
            INSERT INTO user_configs (
                user, remote_host, remote_port, remote_user, remote_pass,
                submission_host, submission_port, use_tls, setup_complete, last_sync
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user) DO UPDATE SET
                remote_host = excluded.remote_host,
                remote_port = excluded.remote_port,
                remote_user = excluded.remote_user,
                remote_pass = excluded.remote_pass,
                submission_host = excluded.submission_host,
                submission_port = excluded.submission_port,
                use_tls = excluded.use_tls,
                setup_complete = excluded.setup_complete,
                last_sync = excluded.last_sync
            "#,
        )
        .bind(&cfg.user)
        .bind(&cfg.remote_host)
        .bind(cfg.remote_port as i64)
        .bind(&cfg.remote_user)
        .bind(&cfg.remote_pass)
        .bind(&cfg.submission_host)
        .bind(cfg.submission_port as i64)
        .bind(cfg.use_tls)
        .bind(cfg.setup_complete)
        .bind(cfg.last_sync)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_config(&self, user: &str) -> Result<Option<UserConfig>, BridgeError> {
        let row = sqlx::query(
            r#"SELECT user, remote_host, remote_port, remote_user, remote_pass,
                      submission_host, submission_port, use_tls, setup_complete, last_sync
               FROM user_configs WHERE user = ?"#,
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| UserConfig {
            user: r.get("user"),
            remote_host: r.get("remote_host"),
            remote_port: r.get::<i64, _>("remote_port") as u16,
            remote_user: r.get("remote_user"),
            remote_pass: r.get("remote_pass"),
            submission_host: r.get("submission_host"),
            submission_port: r.get::<i64, _>("submission_port") as u16,
            use_tls: r.get("use_tls"),
            setup_complete: r.get("setup_complete"),
            last_sync: r.get("last_sync"),
        }))
    }

    pub async fn upsert_label(&self, label: &Label) -> Result<(), BridgeError> {
        sqlx::query(
            r#"INSERT INTO labels (id, user, name, color) VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET name = excluded.name, color = excluded.color"#,
        )
        .bind(&label.id)
        .bind(&label.user)
        .bind(&label.name)
        .bind(&label.color)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_labels(&self, user: &str) -> Result<Vec<Label>, BridgeError> {
        let rows = sqlx::query("SELECT id, user, name, color FROM labels WHERE user = ?")
            .bind(user)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| Label {
                id: r.get("id"),
                user: r.get("user"),
                name: r.get("name"),
                color: r.get("color"),
            })
            .collect())
    }

    pub async fn delete_label(&self, user: &str, id: &str) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM labels WHERE user = ? AND id = ?")
            .bind(user)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upserts a classification rule, unique on `(user, category, value)` (§3/§4.8).
    pub async fn upsert_rule(&self, rule: &ClassificationRule) -> Result<(), BridgeError> {
        sqlx::query(
            r#"INSERT INTO smart_rules (user, category, rule_type, value) VALUES (?, ?, ?, ?)
               ON CONFLICT(user, category, value) DO NOTHING"#,
        )
        .bind(&rule.user)
        .bind(rule.category.as_str())
        .bind(rule_type_str(rule.rule_type))
        .bind(&rule.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_rules(&self, user: &str) -> Result<Vec<ClassificationRule>, BridgeError> {
        let rows =
            sqlx::query("SELECT user, category, rule_type, value FROM smart_rules WHERE user = ?")
                .bind(user)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|r| {
                let category = parse_category(&r.get::<String, _>("category"))?;
                let rule_type = parse_rule_type(&r.get::<String, _>("rule_type"))?;
                Ok(ClassificationRule { user: r.get("user"), category, rule_type, value: r.get("value") })
            })
            .collect()
    }

    pub async fn delete_rule(&self, user: &str, category: Category, value: &str) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM smart_rules WHERE user = ? AND category = ? AND value = ?")
            .bind(user)
            .bind(category.as_str())
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Raw uids present locally for a folder, used by the draft uplink's
    /// reconciliation pass (§4.10 step 3).
    pub async fn uids_in_folder(&self, user: &str, folder: &str) -> Result<Vec<u32>, BridgeError> {
        let rows = sqlx::query("SELECT uid FROM messages WHERE user = ? AND folder = ?")
            .bind(user)
            .bind(folder)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>("uid") as u32).collect())
    }

    /// Count of locally-known messages, used to pick quick-sync vs full-sync (§4.7).
    pub async fn count_messages(&self, user: &str, folder: &str) -> Result<i64, BridgeError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE user = ? AND folder = ?")
            .bind(user)
            .bind(folder)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<Message, BridgeError> {
    let labels_json: String = row.get("labels");
    let attachments_json: String = row.get("attachments");
    let to_addresses_json: String = row.get("to_addresses");
    let category_str: Option<String> = row.get("category");

    Ok(Message {
        id: row.get("id"),
        uid: row.get::<i64, _>("uid") as u32,
        user: row.get("user"),
        from_address: row.get("from_address"),
        from_name: row.get("from_name"),
        to_addresses: serde_json::from_str(&to_addresses_json).unwrap_or_default(),
        subject: row.get("subject"),
        timestamp_ms: row.get("timestamp_ms"),
        body: row.get("body"),
        preview: row.get("preview"),
        is_full_body: row.get("is_full_body"),
        read: row.get("read"),
        folder: row.get("folder"),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        category: category_str.and_then(|c| parse_category(&c).ok()),
        attachments: serde_json::from_str::<Vec<Attachment>>(&attachments_json).unwrap_or_default(),
    })
}

fn parse_category(s: &str) -> Result<Category, BridgeError> {
    match s {
        "primary" => Ok(Category::Primary),
        "social" => Ok(Category::Social),
        "updates" => Ok(Category::Updates),
        "promotions" => Ok(Category::Promotions),
        other => Err(BridgeError::ValidationError(format!("unknown category: {}", other))),
    }
}

fn rule_type_str(rule_type: RuleType) -> &'static str {
    match rule_type {
        RuleType::From => "from",
        RuleType::Subject => "subject",
        RuleType::Content => "content",
    }
}

fn parse_rule_type(s: &str) -> Result<RuleType, BridgeError> {
    match s {
        "from" => Ok(RuleType::From),
        "subject" => Ok(RuleType::Subject),
        "content" => Ok(RuleType::Content),
        other => Err(BridgeError::ValidationError(format!("unknown rule type: {}", other))),
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Message, RuleType};

    async fn temp_storage() -> Storage {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.into_temp_path();
        let url = format!("sqlite://{}?mode=rwc", path.display());
        std::mem::forget(path);
        Storage::connect(&url).await.unwrap()
    }

    fn envelope(uid: u32, folder: &str) -> Message {
        Message::new_envelope(
            "alice",
            uid,
            folder,
            "sender@example.com",
            Some("Sender".to_string()),
            vec!["alice@example.com".to_string()],
            "hello",
            1000 + uid as i64,
        )
    }

    #[tokio::test]
    async fn upsert_and_get_message_round_trips() {
        let storage = temp_storage().await;
        let msg = envelope(1, "Inbox");
        storage.upsert_message(&msg).await.unwrap();

        let fetched = storage.get_message("alice", &msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.subject, "hello");
        assert!(!fetched.is_full_body);
    }

    #[tokio::test]
    async fn upsert_message_updates_mutable_fields_only() {
        let storage = temp_storage().await;
        let mut msg = envelope(2, "Inbox");
        storage.upsert_message(&msg).await.unwrap();

        msg.body = "full body".to_string();
        msg.is_full_body = true;
        msg.read = true;
        storage.upsert_message(&msg).await.unwrap();

        let fetched = storage.get_message("alice", &msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.body, "full body");
        assert!(fetched.is_full_body);
        assert!(fetched.read);
        assert_eq!(fetched.from_address, "sender@example.com");
    }

    #[tokio::test]
    async fn list_messages_filters_by_category_and_orders_newest_first() {
        let storage = temp_storage().await;
        let mut older = envelope(3, "Inbox");
        older.category = Some(Category::Primary);
        let mut newer = envelope(4, "Inbox");
        newer.category = Some(Category::Social);
        storage.upsert_message(&older).await.unwrap();
        storage.upsert_message(&newer).await.unwrap();

        let all = storage.list_messages("alice", "Inbox", None).await.unwrap();
        assert_eq!(all.first().unwrap().id, newer.id);

        let social = storage.list_messages("alice", "Inbox", Some(Category::Social)).await.unwrap();
        assert_eq!(social.len(), 1);
        assert_eq!(social[0].id, newer.id);
    }

    #[tokio::test]
    async fn count_messages_reflects_folder_scope() {
        let storage = temp_storage().await;
        storage.upsert_message(&envelope(5, "Inbox")).await.unwrap();
        storage.upsert_message(&envelope(6, "Trash")).await.unwrap();

        assert_eq!(storage.count_messages("alice", "Inbox").await.unwrap(), 1);
        assert_eq!(storage.count_messages("alice", "Trash").await.unwrap(), 1);
        assert_eq!(storage.count_messages("bob", "Inbox").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn user_config_round_trips_credentials() {
        let storage = temp_storage().await;
        let cfg = UserConfig {
            user: "alice".to_string(),
            remote_host: "imap.example.com".to_string(),
            remote_port: 993,
            remote_user: "alice@example.com".to_string(),
            remote_pass: "hunter2".to_string(),
            submission_host: "smtp.example.com".to_string(),
            submission_port: 587,
            use_tls: true,
            setup_complete: false,
            last_sync: None,
        };
        storage.upsert_user_config(&cfg).await.unwrap();

        let fetched = storage.get_user_config("alice").await.unwrap().unwrap();
        assert_eq!(fetched.remote_pass, "hunter2");
        assert_eq!(fetched.remote_port, 993);

        let mut updated = fetched;
        updated.setup_complete = true;
        updated.last_sync = Some(now_ms());
        storage.upsert_user_config(&updated).await.unwrap();

        let refetched = storage.get_user_config("alice").await.unwrap().unwrap();
        assert!(refetched.setup_complete);
        assert!(refetched.last_sync.is_some());
    }

    #[tokio::test]
    async fn rules_are_unique_on_user_category_value() {
        let storage = temp_storage().await;
        let rule = ClassificationRule {
            user: "alice".to_string(),
            category: Category::Social,
            rule_type: RuleType::From,
            value: "facebook.com".to_string(),
        };
        storage.upsert_rule(&rule).await.unwrap();
        storage.upsert_rule(&rule).await.unwrap();

        let rules = storage.list_rules("alice").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].category, Category::Social);
    }

    #[tokio::test]
    async fn uids_in_folder_returns_only_that_folders_uids() {
        let storage = temp_storage().await;
        storage.upsert_message(&envelope(7, "Inbox")).await.unwrap();
        storage.upsert_message(&envelope(8, "Inbox")).await.unwrap();
        storage.upsert_message(&envelope(9, "Drafts")).await.unwrap();

        let mut uids = storage.uids_in_folder("alice", "Inbox").await.unwrap();
        uids.sort();
        assert_eq!(uids, vec![7, 8]);
    }
}
