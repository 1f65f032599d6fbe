//! Directory of JSON files, one per conversation

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::conversation::{ConversationName, Message};

use super::{
    decode_messages, encode_messages, ConversationStream, HistoryError, HistoryStore,
    StoredConversation,
};

/// History kept as `<dir>/<conversation name>` JSON files
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &ConversationName) -> PathBuf {
        self.dir.join(name.as_str())
    }
}

async fn read_conversation(
    path: &Path,
    name: &ConversationName,
) -> Result<Vec<Message>, HistoryError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(HistoryError::NotFound(name.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    decode_messages(name, &bytes)
}

#[async_trait]
impl HistoryStore for JsonDirStore {
    async fn list_conversations(&self) -> Result<ConversationStream, HistoryError> {
        fs::create_dir_all(&self.dir).await?;
        let mut entries = fs::read_dir(&self.dir).await?;
        let dir = self.dir.clone();

        let stream = async_stream::stream! {
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stopped listing {}: {}", dir.display(), e);
                        break;
                    }
                };

                let name = match entry.file_name().to_str().and_then(ConversationName::parse) {
                    Some(name) => name,
                    None => continue,
                };

                match read_conversation(&entry.path(), &name).await {
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
        read_conversation(&self.path_for(name), name).await
    }

    async fn save_conversation(
        &self,
        name: &ConversationName,
        messages: &[Message],
    ) -> Result<(), HistoryError> {
        let bytes = encode_messages(messages)?;
        fs::create_dir_all(&self.dir).await?;

        // Write beside the target and rename over it, so a crash leaves the
        // previous version rather than a truncated file.
        let tmp = self.dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, self.path_for(name)).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                warn!("Could not remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e.into());
        }

        debug!("Saved {} ({} messages)", name, messages.len());
        Ok(())
    }

    async fn delete_all(&self) -> Result<usize, HistoryError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_conversation = entry
                .file_name()
                .to_str()
                .and_then(ConversationName::parse)
                .is_some();
            if is_conversation && entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }

        debug!("Removed {} conversation(s) from {}", removed, self.dir.display());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn name(raw: &str) -> ConversationName {
        ConversationName::parse(raw).unwrap()
    }

    async fn listed(store: &JsonDirStore) -> Vec<StoredConversation> {
        store.list_conversations().await.unwrap().collect().await
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let id = name("20250205165542_Hello.json");
        let messages = vec![Message::user("Hello"), Message::assistant("Hi there!")];

        store.save_conversation(&id, &messages).await.unwrap();
        assert_eq!(store.load_conversation(&id).await.unwrap(), messages);
    }

    #[tokio::test]
    async fn test_repeated_save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let id = name("20250205165542_Hello.json");
        let messages = vec![Message::user("焦虑怎么办"), Message::assistant("先深呼吸。")];

        store.save_conversation(&id, &messages).await.unwrap();
        let first = std::fs::read(dir.path().join(id.as_str())).unwrap();
        store.save_conversation(&id, &messages).await.unwrap();
        let second = std::fs::read(dir.path().join(id.as_str())).unwrap();

        assert_eq!(first, second);
        assert!(String::from_utf8(first).unwrap().contains("焦虑怎么办"));
    }

    #[tokio::test]
    async fn test_save_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let id = name("20250205165542_Hello.json");

        store
            .save_conversation(&id, &[Message::user("a"), Message::assistant("b")])
            .await
            .unwrap();
        store.save_conversation(&id, &[Message::user("c")]).await.unwrap();

        assert_eq!(store.load_conversation(&id).await.unwrap(), vec![Message::user("c")]);
        assert_eq!(listed(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let id = name("20250101000000_Hello.json");
        // a directory in the way of the target file
        std::fs::create_dir(dir.path().join(id.as_str())).unwrap();

        let err = store
            .save_conversation(&id, &[Message::user("Hello")])
            .await
            .unwrap_err();

        assert!(matches!(err, HistoryError::Io(_)));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());

        let err = store
            .load_conversation(&name("20250101000000_none.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_corrupt_is_corrupt_data() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20250101000000_bad.json"), "{ nope")
            .unwrap();
        let store = JsonDirStore::new(dir.path());

        let err = store
            .load_conversation(&name("20250101000000_bad.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::CorruptData { .. }));
    }

    #[tokio::test]
    async fn test_list_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let history = dir.path().join("history");
        let store = JsonDirStore::new(&history);

        assert!(listed(&store).await.is_empty());
        assert!(history.is_dir());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let good = name("20250101000001_good.json");
        store.save_conversation(&good, &[Message::user("good")]).await.unwrap();
        std::fs::write(dir.path().join("20250101000002_bad.json"), "[{")
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me")
            .unwrap();

        let all = listed(&store).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, good);
    }

    #[tokio::test]
    async fn test_list_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        store
            .save_conversation(&name("20250101000001_a.json"), &[Message::user("a")])
            .await
            .unwrap();
        assert_eq!(listed(&store).await.len(), 1);

        // Written behind the store's back; the next listing sees it.
        std::fs::write(
            dir.path().join("20250101000002_b.json"),
            r#"[{"role":"user","content":"b"}]"#,
        )
        .unwrap();
        assert_eq!(listed(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_all_removes_conversations_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        store
            .save_conversation(&name("20250101000001_a.json"), &[Message::user("a")])
            .await
            .unwrap();
        store
            .save_conversation(&name("20250101000002_b.json"), &[Message::user("b")])
            .await
            .unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(listed(&store).await.is_empty());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_all_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path().join("missing"));
        assert_eq!(store.delete_all().await.unwrap(), 0);
    }
}
