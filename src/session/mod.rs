//! The active conversation
//!
//! A [`Session`] is owned by whoever handles requests for the single user of
//! the process. It only ever holds user and assistant messages; the persona
//! instruction is added to outbound requests and never lands here.

use tracing::{debug, warn};

use crate::conversation::{ConversationName, Message, Role};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    name: Option<ConversationName>,
    messages: Vec<Message>,
}

/// Session shape before a turn, used to undo a turn that did not commit.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    len: usize,
    named: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the active conversation ("new conversation").
    pub fn reset(&mut self) {
        self.name = None;
        self.messages.clear();
    }

    /// Adopt a stored conversation as the active one.
    pub fn restore(&mut self, name: ConversationName, messages: Vec<Message>) {
        let before = messages.len();
        self.messages = messages
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
        if self.messages.len() != before {
            warn!("Dropped {} system message(s) restoring {}", before - self.messages.len(), name);
        }
        debug!("Restored {} ({} messages)", name, self.messages.len());
        self.name = Some(name);
    }

    pub fn append_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Name the conversation unless it already has a name. Returns the name
    /// in effect afterwards.
    pub fn assign_name_if_absent<F>(&mut self, generate: F) -> &ConversationName
    where
        F: FnOnce(&[Message]) -> ConversationName,
    {
        let messages = &self.messages;
        self.name.get_or_insert_with(|| generate(messages))
    }

    pub fn name(&self) -> Option<&ConversationName> {
        self.name.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Text of the first user message, which names the conversation.
    pub fn first_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.messages.len(),
            named: self.name.is_some(),
        }
    }

    /// Undo everything appended or named since `checkpoint`.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        self.messages.truncate(checkpoint.len);
        if !checkpoint.named {
            self.name = None;
        }
    }
}
