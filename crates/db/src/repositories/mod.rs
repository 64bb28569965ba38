use async_trait::async_trait;
use thiserror::Error;

use pledge_core::domain::thread::{Thread, ThreadId};
use pledge_core::errors::ApplicationError;

pub mod config_store;
pub mod memory;
pub mod thread;

pub use config_store::{load_settings, save_settings, SqlConfigStore};
pub use memory::{InMemoryConfigStore, InMemoryThreadRepository};
pub use thread::SqlThreadRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("thread `{id}` was modified concurrently (expected version {expected})")]
    VersionConflict { id: String, expected: u64 },
    #[error("thread `{id}` still conflicted after {attempts} attempts")]
    ConflictRetriesExhausted { id: String, attempts: u32 },
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

/// Whole-record storage for threads, guarded by each thread's `version`.
#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<Thread>, RepositoryError>;

    /// Writes the thread only if the stored version still equals
    /// `thread.version` (zero meaning "not stored yet") and returns it with the
    /// version bumped. A mismatch is [`RepositoryError::VersionConflict`].
    async fn upsert(&self, thread: Thread) -> Result<Thread, RepositoryError>;

    async fn list_ids(&self) -> Result<Vec<ThreadId>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Thread>, RepositoryError>;

    async fn delete(&self, id: &ThreadId) -> Result<bool, RepositoryError>;
}

/// Named text blobs: prompts and sampling parameters.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<Option<String>, RepositoryError>;
    async fn write(&self, name: &str, content: &str) -> Result<(), RepositoryError>;
}
