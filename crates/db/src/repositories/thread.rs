use chrono::{DateTime, Utc};
use pledge_core::domain::thread::{Thread, ThreadId};
use sqlx::{sqlite::SqliteRow, Row};

use super::{RepositoryError, ThreadRepository};
use crate::DbPool;

pub struct SqlThreadRepository {
    pool: DbPool,
}

impl SqlThreadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_THREAD: &str = "SELECT
        id,
        channel_key,
        participants_json,
        chats_json,
        promises_json,
        responded_since_last_change,
        version,
        created_at,
        updated_at
     FROM chat_thread";

#[async_trait::async_trait]
impl ThreadRepository for SqlThreadRepository {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<Thread>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_THREAD} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(thread_from_row).transpose()
    }

    async fn upsert(&self, thread: Thread) -> Result<Thread, RepositoryError> {
        let participants_json = encode("participants", &thread.participants)?;
        let chats_json = encode("chats", &thread.chats)?;
        let promises_json = encode("promises", &thread.promises)?;
        let next_version = thread.version + 1;

        let result = if thread.version == 0 {
            sqlx::query(
                "INSERT INTO chat_thread (
                    id,
                    channel_key,
                    participants_json,
                    chats_json,
                    promises_json,
                    responded_since_last_change,
                    version,
                    created_at,
                    updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&thread.id.0)
            .bind(&thread.channel_key)
            .bind(&participants_json)
            .bind(&chats_json)
            .bind(&promises_json)
            .bind(thread.responded_since_last_change)
            .bind(version_to_i64(next_version)?)
            .bind(thread.created_at.to_rfc3339())
            .bind(thread.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE chat_thread SET
                    channel_key = ?,
                    participants_json = ?,
                    chats_json = ?,
                    promises_json = ?,
                    responded_since_last_change = ?,
                    version = ?,
                    updated_at = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(&thread.channel_key)
            .bind(&participants_json)
            .bind(&chats_json)
            .bind(&promises_json)
            .bind(thread.responded_since_last_change)
            .bind(version_to_i64(next_version)?)
            .bind(thread.updated_at.to_rfc3339())
            .bind(&thread.id.0)
            .bind(version_to_i64(thread.version)?)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                id: thread.id.0.clone(),
                expected: thread.version,
            });
        }

        Ok(Thread { version: next_version, ..thread })
    }

    async fn list_ids(&self) -> Result<Vec<ThreadId>, RepositoryError> {
        let rows = sqlx::query("SELECT id FROM chat_thread ORDER BY updated_at DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok(ThreadId(row.try_get::<String, _>("id")?)))
            .collect()
    }

    async fn list_all(&self) -> Result<Vec<Thread>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_THREAD} ORDER BY updated_at DESC, id ASC"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(thread_from_row).collect()
    }

    async fn delete(&self, id: &ThreadId) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM chat_thread WHERE id = ?").bind(&id.0).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

fn thread_from_row(row: SqliteRow) -> Result<Thread, RepositoryError> {
    let version = row.try_get::<i64, _>("version")?;

    Ok(Thread {
        id: ThreadId(row.try_get("id")?),
        channel_key: row.try_get("channel_key")?,
        participants: decode("participants_json", &row.try_get::<String, _>("participants_json")?)?,
        chats: decode("chats_json", &row.try_get::<String, _>("chats_json")?)?,
        promises: decode("promises_json", &row.try_get::<String, _>("promises_json")?)?,
        responded_since_last_change: row.try_get("responded_since_last_change")?,
        version: u64::try_from(version).map_err(|_| {
            RepositoryError::Decode(format!("negative thread version `{version}`"))
        })?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn encode<T: serde::Serialize>(field: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode {field}: {error}")))
}

fn decode<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid JSON in `{column}`: {error}")))
}

fn version_to_i64(version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version)
        .map_err(|_| RepositoryError::Decode(format!("thread version `{version}` overflows")))
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
