use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{MessageId, UserId},
    protocol::MessagePayload,
};

/// Durable, append-only record of direct messages.
///
/// Ids handed out by `append` are strictly increasing in insertion order, and
/// `query` pages are cut from the newest message backwards but returned
/// oldest-first.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage>;

    async fn query(
        &self,
        user_a: UserId,
        user_b: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredMessage>>;
}

/// Lookup side of the account directory. Registration lives elsewhere.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: UserId) -> Result<bool>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl From<StoredMessage> for MessagePayload {
    fn from(message: StoredMessage) -> Self {
        Self {
            id: message.message_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            timestamp: message.created_at,
            read: message.read,
        }
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create user '{username}'"))?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn count_messages(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage> {
        let row = sqlx::query(
            "INSERT INTO messages (sender_id, receiver_id, content, created_at, read)
             VALUES (?, ?, ?, ?, 0)
             RETURNING id, sender_id, receiver_id, content, created_at, read",
        )
        .bind(message.sender_id.0)
        .bind(message.receiver_id.0)
        .bind(&message.content)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to store message {} -> {}",
                message.sender_id, message.receiver_id
            )
        })?;
        Ok(stored_message_from_row(&row))
    }

    async fn query(
        &self,
        user_a: UserId,
        user_b: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, content, created_at, read
             FROM messages
             WHERE (sender_id = ? AND receiver_id = ?)
                OR (sender_id = ? AND receiver_id = ?)
             ORDER BY id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_a.0)
        .bind(user_b.0)
        .bind(user_b.0)
        .bind(user_a.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load conversation {user_a} <-> {user_b}"))?;

        rows.reverse();
        Ok(rows.iter().map(stored_message_from_row).collect())
    }
}

#[async_trait]
impl UserDirectory for Storage {
    async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("user lookup failed")?;
        Ok(row.is_some())
    }
}

fn stored_message_from_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        sender_id: UserId(r.get::<i64, _>(1)),
        receiver_id: UserId(r.get::<i64, _>(2)),
        content: r.get::<String, _>(3),
        created_at: r.get::<DateTime<Utc>, _>(4),
        read: r.get::<bool, _>(5),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
