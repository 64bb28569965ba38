pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod upsert;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use repositories::{
    load_settings, save_settings, ConfigStore, InMemoryConfigStore, InMemoryThreadRepository,
    RepositoryError, SqlConfigStore, SqlThreadRepository, ThreadRepository,
};
pub use upsert::{read_modify_upsert, Committed, Mutation, DEFAULT_MAX_ATTEMPTS};
