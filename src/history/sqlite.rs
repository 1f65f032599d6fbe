//! Conversation history in SQLite
//!
//! Drop-in alternative to the JSON directory: one row per conversation,
//! the message list stored as the same JSON text the directory backend
//! writes to disk.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use crate::conversation::{ConversationName, Message};

use super::{
    decode_messages, encode_messages, ConversationStream, HistoryError, HistoryStore,
    StoredConversation,
};

/// History store backed by a SQLite database
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Open (or create) the database at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        // A second connection would see a different empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                name TEXT PRIMARY KEY,
                messages TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn list_conversations(&self) -> Result<ConversationStream, HistoryError> {
        let pool = self.pool.clone();

        let stream = async_stream::stream! {
            let mut rows = sqlx::query_as::<_, (String, String)>(
                "SELECT name, messages FROM conversations",
            )
            .fetch(&pool);

            while let Some(row) = rows.next().await {
                let (raw_name, body) = match row {
                    Ok(row) => row,
                    Err(e) => {
                        warn!("Stopped listing conversations: {}", e);
                        break;
                    }
                };

                let name = match ConversationName::parse(&raw_name) {
                    Some(name) => name,
                    None => {
                        warn!("Skipping row with invalid name {:?}", raw_name);
                        continue;
                    }
                };

                match decode_messages(&name, body.as_bytes()) {
                    Ok(messages) => {
                        yield StoredConversation { name, messages };
                    }
                    Err(e) => warn!("Skipping conversation {}: {}", name, e),
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn load_conversation(
        &self,
        name: &ConversationName,
    ) -> Result<Vec<Message>, HistoryError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT messages FROM conversations WHERE name = ?")
                .bind(name.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((body,)) => decode_messages(name, body.as_bytes()),
            None => Err(HistoryError::NotFound(name.to_string())),
        }
    }

    async fn save_conversation(
        &self,
        name: &ConversationName,
        messages: &[Message],
    ) -> Result<(), HistoryError> {
        let body = String::from_utf8_lossy(&encode_messages(messages)?).into_owned();

        sqlx::query(
            r#"
            INSERT INTO conversations (name, messages) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE
            SET messages = excluded.messages, updated_at = datetime('now')
            "#,
        )
        .bind(name.as_str())
        .bind(body)
        .execute(&self.pool)
        .await?;

        debug!("Saved {} ({} messages)", name, messages.len());
        Ok(())
    }

    async fn delete_all(&self) -> Result<usize, HistoryError> {
        let result = sqlx::query("DELETE FROM conversations")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }
}
