use pledge_core::domain::thread::Thread;
use pledge_db::{SqlThreadRepository, ThreadRepository};
use serde::Serialize;

use crate::commands::{current_thread_runtime, load_config, open_migrated_pool, to_data, CommandResult};

#[derive(Debug, Serialize)]
struct ThreadListing {
    id: String,
    channel_key: String,
    participants: Vec<String>,
    chats: usize,
    open_promises: usize,
    awaiting_response: bool,
}

impl From<&Thread> for ThreadListing {
    fn from(thread: &Thread) -> Self {
        Self {
            id: thread.id.to_string(),
            channel_key: thread.channel_key.clone(),
            participants: thread.participants.clone(),
            chats: thread.chats.len(),
            open_promises: thread.open_promises().count(),
            awaiting_response: !thread.responded_since_last_change,
        }
    }
}

pub fn run() -> CommandResult {
    let config = match load_config("threads") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let runtime = match current_thread_runtime("threads") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;
        let threads = SqlThreadRepository::new(pool.clone()).list_all().await;
        pool.close().await;
        threads.map_err(|error| ("operation", error.to_string(), 6u8))
    });

    match result {
        Ok(threads) => {
            let listing: Vec<ThreadListing> = threads.iter().map(ThreadListing::from).collect();
            let open: usize = listing.iter().map(|thread| thread.open_promises).sum();
            CommandResult::success_with_data(
                "threads",
                format!("{} stored threads, {open} open promises", listing.len()),
                to_data(&listing),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("threads", error_class, message, exit_code)
        }
    }
}
