use std::collections::HashMap;

use tokio::sync::RwLock;

use pledge_core::domain::thread::{Thread, ThreadId};

use super::{ConfigStore, RepositoryError, ThreadRepository};

#[derive(Default)]
pub struct InMemoryThreadRepository {
    threads: RwLock<HashMap<String, Thread>>,
}

#[async_trait::async_trait]
impl ThreadRepository for InMemoryThreadRepository {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<Thread>, RepositoryError> {
        let threads = self.threads.read().await;
        Ok(threads.get(&id.0).cloned())
    }

    async fn upsert(&self, thread: Thread) -> Result<Thread, RepositoryError> {
        let mut threads = self.threads.write().await;
        let stored_version = threads.get(&thread.id.0).map(|stored| stored.version).unwrap_or(0);
        if stored_version != thread.version {
            return Err(RepositoryError::VersionConflict {
                id: thread.id.0.clone(),
                expected: thread.version,
            });
        }

        let stored = Thread { version: thread.version + 1, ..thread };
        threads.insert(stored.id.0.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_ids(&self) -> Result<Vec<ThreadId>, RepositoryError> {
        let threads = self.threads.read().await;
        let mut ids: Vec<ThreadId> = threads.keys().cloned().map(ThreadId).collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_all(&self) -> Result<Vec<Thread>, RepositoryError> {
        let threads = self.threads.read().await;
        let mut all: Vec<Thread> = threads.values().cloned().collect();
        all.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(all)
    }

    async fn delete(&self, id: &ThreadId) -> Result<bool, RepositoryError> {
        let mut threads = self.threads.write().await;
        Ok(threads.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryConfigStore {
    blobs: RwLock<HashMap<String, String>>,
}

impl InMemoryConfigStore {
    pub fn with_blobs<I, K, V>(blobs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            blobs: RwLock::new(
                blobs.into_iter().map(|(name, content)| (name.into(), content.into())).collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn read(&self, name: &str) -> Result<Option<String>, RepositoryError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(name).cloned())
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), RepositoryError> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(name.to_string(), content.to_string());
        Ok(())
    }
}
