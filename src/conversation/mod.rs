//! Conversation types: messages, roles and the identifying name a
//! conversation is stored under.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// File extension every stored conversation carries.
pub const EXTENSION: &str = ".json";

/// Characters of the first user message kept in a conversation name.
pub const EXCERPT_CHARS: usize = 8;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Identifying name of a stored conversation,
/// `<YYYYMMDDHHMMSS>_<excerpt>.json`.
///
/// A name is always a single file name: it never contains a path separator,
/// so it can be joined onto the history directory without escaping it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationName(String);

impl ConversationName {
    /// Mint a name from the creation time and the first user message.
    pub fn generate(first_user_message: &str, created: NaiveDateTime) -> Self {
        Self(format!(
            "{}_{}{}",
            created.format("%Y%m%d%H%M%S"),
            excerpt(first_user_message),
            EXTENSION
        ))
    }

    /// Accept an externally supplied name (file listing, API request).
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() > EXTENSION.len()
            && raw.ends_with(EXTENSION)
            && !raw.contains(['/', '\\', '\0']);
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display label: the excerpt portion of the name.
    pub fn label(&self) -> &str {
        let stem = self.0.strip_suffix(EXTENSION).unwrap_or(&self.0);
        match stem.split_once('_') {
            Some((_, excerpt)) => excerpt,
            None => stem,
        }
    }
}

impl fmt::Display for ConversationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ConversationName> for String {
    fn from(name: ConversationName) -> Self {
        name.0
    }
}

impl TryFrom<String> for ConversationName {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("invalid conversation name: {raw}"))
    }
}

/// Short, file-name-safe excerpt of a message.
///
/// Spaces become underscores, as do path separators and control characters.
/// Anything longer than [`EXCERPT_CHARS`] characters is cut and marked with
/// a trailing `...`.
pub fn excerpt(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if cleaned.chars().count() > EXCERPT_CHARS {
        let mut cut: String = cleaned.chars().take(EXCERPT_CHARS).collect();
        cut.push_str(ELLIPSIS);
        cut
    } else {
        cleaned
    }
}
