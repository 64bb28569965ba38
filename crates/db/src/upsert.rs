//! Optimistic read-modify-write over [`ThreadRepository`].

use chrono::Utc;
use pledge_core::domain::thread::{Thread, ThreadId};
use tracing::debug;

use crate::repositories::{RepositoryError, ThreadRepository};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// What a mutation decided after looking at the current stored thread.
pub enum Mutation<T> {
    Save(Thread, T),
    Keep(T),
}

pub struct Committed<T> {
    pub value: T,
    /// The thread as it now stands in the store, when one exists.
    pub thread: Option<Thread>,
}

/// Reads the thread, hands it to `apply`, and writes the result back guarded by
/// its version. On a conflicting write the whole cycle starts over from a fresh
/// read, so `apply` must be free of side effects.
pub async fn read_modify_upsert<R, T, F>(
    repo: &R,
    id: &ThreadId,
    max_attempts: u32,
    mut apply: F,
) -> Result<Committed<T>, RepositoryError>
where
    R: ThreadRepository + ?Sized,
    F: FnMut(Option<Thread>) -> Mutation<T> + Send,
    T: Send,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let current = repo.find_by_id(id).await?;
        let (mut thread, value) = match apply(current.clone()) {
            Mutation::Keep(value) => return Ok(Committed { value, thread: current }),
            Mutation::Save(thread, value) => (thread, value),
        };
        thread.updated_at = Utc::now();

        match repo.upsert(thread).await {
            Ok(stored) => return Ok(Committed { value, thread: Some(stored) }),
            Err(RepositoryError::VersionConflict { expected, .. }) => {
                debug!(
                    event_name = "db.thread.version_conflict",
                    thread_id = %id,
                    attempt,
                    expected_version = expected,
                    "thread changed underneath; retrying from a fresh read"
                );
            }
            Err(error) => return Err(error),
        }
    }

    Err(RepositoryError::ConflictRetriesExhausted { id: id.0.clone(), attempts: max_attempts })
}
