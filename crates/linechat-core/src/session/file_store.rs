use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SessionError;
use crate::util::safe_filename;

use super::store::{ConversationStore, StoreSession};
use super::Conversation;

/// File-based store: one JSON document per user.
pub struct FileConversationStore {
    dir: PathBuf,
}

impl FileConversationStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn open(&self) -> Result<Box<dyn StoreSession>, SessionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SessionError::Open(format!("{}: {}", self.dir.display(), e)))?;
        Ok(Box::new(FileSession {
            dir: self.dir.clone(),
        }))
    }
}

struct FileSession {
    dir: PathBuf,
}

impl FileSession {
    fn record_path(&self, user_id: &str) -> Result<PathBuf, SessionError> {
        let safe_key = safe_filename(user_id);
        if safe_key.is_empty() || safe_key.starts_with('.') {
            return Err(SessionError::InvalidKey(user_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", safe_key)))
    }
}

#[async_trait]
impl StoreSession for FileSession {
    async fn get(&self, user_id: &str) -> Result<Option<Conversation>, SessionError> {
        let path = self.record_path(user_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionError::Read(format!("{}: {}", path.display(), e))),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| SessionError::Corrupt(format!("{}: {}", path.display(), e)))
    }

    async fn set(&self, user_id: &str, conversation: &Conversation) -> Result<(), SessionError> {
        let path = self.record_path(user_id)?;
        let json = serde_json::to_string_pretty(conversation)
            .map_err(|e| SessionError::Write(e.to_string()))?;

        // Each write gets its own temp file beside the target, then renames over
        // it: readers see the old or the new record and concurrent writers for
        // one user never share a temp path. The last rename wins.
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, json.as_bytes()))
            .await
            .map_err(|e| SessionError::Write(format!("write task: {}", e)))??;

        debug!("Saved conversation for {} ({} turns)", user_id, conversation.len());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}

fn write_atomic(dir: &Path, path: &Path, contents: &[u8]) -> Result<(), SessionError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| SessionError::Write(format!("{}: {}", dir.display(), e)))?;
    tmp.write_all(contents)
        .map_err(|e| SessionError::Write(format!("{}: {}", tmp.path().display(), e)))?;
    tmp.persist(path)
        .map_err(|e| SessionError::Write(format!("{}: {}", path.display(), e.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use std::time::Duration;

    #[tokio::test]
    async fn test_file_store_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(tmp.path().join("conversations"));
        let now = chrono::Utc::now();

        let mut conv = Conversation::new(now, Duration::from_secs(1800));
        conv.push_turn(Role::User, "Hello", now);
        conv.push_turn(Role::Assistant, "Hi!", now);

        let session = store.open().await.unwrap();
        session.set("U1234567890", &conv).await.unwrap();
        session.close().await.unwrap();

        let path = store.dir().join("U1234567890.json");
        assert!(path.exists());
        let entries: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(entries.len(), 1, "no temp files left behind");

        let session = store.open().await.unwrap();
        let loaded = session.get("U1234567890").await.unwrap().unwrap();
        assert_eq!(loaded, conv);
    }

    #[tokio::test]
    async fn test_file_store_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(tmp.path());
        let session = store.open().await.unwrap();
        assert!(session.get("U-new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(tmp.path());
        std::fs::write(tmp.path().join("Ubad.json"), "not json").unwrap();

        let session = store.open().await.unwrap();
        let err = session.get("Ubad").await.unwrap_err();
        assert!(matches!(err, SessionError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_file_store_rejects_unsafe_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(tmp.path());
        let session = store.open().await.unwrap();
        assert!(matches!(
            session.get("").await.unwrap_err(),
            SessionError::InvalidKey(_)
        ));
        assert!(matches!(
            session.get("..").await.unwrap_err(),
            SessionError::InvalidKey(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_store_concurrent_sets_same_user() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileConversationStore::new(tmp.path()));
        let now = chrono::Utc::now();

        for round in 0..25 {
            let mut handles = Vec::new();
            for writer in 0..4 {
                let store = store.clone();
                let mut conv = Conversation::new(now, Duration::from_secs(1800));
                for i in 0..=writer {
                    conv.push_turn(Role::User, format!("round {round} writer {writer} turn {i}"), now);
                }
                handles.push(tokio::spawn(async move {
                    let session = store.open().await.unwrap();
                    let result = session.set("U1", &conv).await;
                    session.close().await.unwrap();
                    result
                }));
            }
            for handle in handles {
                handle.await.unwrap().expect("concurrent set must succeed");
            }

            // One complete record survives.
            let session = store.open().await.unwrap();
            let stored = session.get("U1").await.unwrap().unwrap();
            assert!((1..=4).contains(&stored.len()));
            assert!(stored.messages[0].content.starts_with(&format!("round {round} ")));
        }

        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
