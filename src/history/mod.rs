//! Durable conversation history
//!
//! One stored entry per conversation, keyed by its [`ConversationName`] and
//! holding the complete ordered message list. Two backends implement the
//! same [`HistoryStore`] contract:
//! - [`JsonDirStore`]: one pretty-printed `.json` file per conversation
//! - [`SqliteHistoryStore`]: one row per conversation, same JSON payload
//!
//! Nothing is cached between calls; every listing re-reads the backend.

mod json_dir;
mod sqlite;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use thiserror::Error;

use crate::conversation::{ConversationName, Message, Role};

pub use json_dir::JsonDirStore;
pub use sqlite::SqliteHistoryStore;

/// Number of conversations the history index shows.
pub const INDEX_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Corrupt conversation data in {identifier}: {reason}")]
    CorruptData { identifier: String, reason: String },

    #[error("Invalid conversation identifier: {0}")]
    InvalidIdentifier(String),

    #[error("System messages are never persisted")]
    SystemMessage,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A conversation as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConversation {
    pub name: ConversationName,
    pub messages: Vec<Message>,
}

impl StoredConversation {
    pub fn label(&self) -> &str {
        self.name.label()
    }
}

/// Lazy listing of stored conversations. Entries that cannot be read or
/// decoded are skipped.
pub type ConversationStream = BoxStream<'static, StoredConversation>;

/// Persistence backend for conversation history
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Enumerate every stored conversation, creating the backing storage if
    /// it does not exist yet.
    async fn list_conversations(&self) -> Result<ConversationStream, HistoryError>;

    /// Read one conversation's messages.
    async fn load_conversation(&self, name: &ConversationName)
        -> Result<Vec<Message>, HistoryError>;

    /// Replace the stored messages of `name` with `messages`.
    async fn save_conversation(
        &self,
        name: &ConversationName,
        messages: &[Message],
    ) -> Result<(), HistoryError>;

    /// Remove every stored conversation. Returns how many were removed.
    async fn delete_all(&self) -> Result<usize, HistoryError>;
}

/// The most recent conversations, newest name first.
pub async fn recent_conversations(
    store: &dyn HistoryStore,
    limit: usize,
) -> Result<Vec<StoredConversation>, HistoryError> {
    let mut all: Vec<StoredConversation> = store.list_conversations().await?.collect().await;
    all.sort_by(|a, b| b.name.cmp(&a.name));
    all.truncate(limit);
    Ok(all)
}

/// Encode a message list the way it is stored: 4-space indentation,
/// non-ASCII written literally.
pub fn encode_messages(messages: &[Message]) -> Result<Vec<u8>, HistoryError> {
    if messages.iter().any(|m| m.role == Role::System) {
        return Err(HistoryError::SystemMessage);
    }

    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    messages.serialize(&mut ser)?;
    Ok(buf)
}

/// Decode a stored message list. System messages make the data corrupt.
pub fn decode_messages(
    name: &ConversationName,
    bytes: &[u8],
) -> Result<Vec<Message>, HistoryError> {
    let corrupt = |reason: String| HistoryError::CorruptData {
        identifier: name.to_string(),
        reason,
    };

    let messages: Vec<Message> = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    if messages.iter().any(|m| m.role == Role::System) {
        return Err(corrupt("contains a system message".to_string()));
    }
    Ok(messages)
}
