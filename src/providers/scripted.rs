//! In-process provider that replays a fixed script, for tests

use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::conversation::Message;

use super::{CompletionProvider, FragmentStream, ProviderError};

enum Script {
    Reply(Vec<String>),
    FailAfter(Vec<String>),
    Refuse,
}

pub struct ScriptedProvider {
    script: Script,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    /// Streams `fragments`, then completes.
    pub fn replying(fragments: &[&str]) -> Self {
        Self::new(Script::Reply(owned(fragments)))
    }

    /// Streams `fragments`, then errors.
    pub fn failing_after(fragments: &[&str]) -> Self {
        Self::new(Script::FailAfter(owned(fragments)))
    }

    /// Fails before streaming anything.
    pub fn refusing() -> Self {
        Self::new(Script::Refuse)
    }

    fn new(script: Script) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

fn owned(fragments: &[&str]) -> Vec<String> {
    fragments.iter().map(|f| f.to_string()).collect()
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream_chat(
        &self,
        messages: &[Message],
        _model: &str,
    ) -> Result<FragmentStream, ProviderError> {
        self.requests.lock().unwrap().push(messages.to_vec());

        let items: Vec<Result<String, ProviderError>> = match &self.script {
            Script::Reply(fragments) => fragments.iter().cloned().map(Ok).collect(),
            Script::FailAfter(fragments) => fragments
                .iter()
                .cloned()
                .map(Ok)
                .chain(std::iter::once(Err(ProviderError::Interrupted)))
                .collect(),
            Script::Refuse => return Err(ProviderError::Api("HTTP 503: unavailable".into())),
        };

        Ok(Box::pin(stream::iter(items)))
    }
}
