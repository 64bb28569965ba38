use chrono::Utc;
use pledge_core::domain::settings::{SettingKey, Settings, SettingsBlobs};
use pledge_core::errors::ApplicationError;
use sqlx::Row;

use super::{ConfigStore, RepositoryError};
use crate::DbPool;

pub struct SqlConfigStore {
    pool: DbPool,
}

impl SqlConfigStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConfigStore for SqlConfigStore {
    async fn read(&self, name: &str) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT content FROM config_blob WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.try_get::<String, _>("content").map_err(RepositoryError::from))
            .transpose()
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO config_blob (name, content, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                content = excluded.content,
                updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Reads every settings blob and resolves them. A store failure is a
/// persistence error; a missing prompt is a configuration error.
pub async fn load_settings(store: &dyn ConfigStore) -> Result<Settings, ApplicationError> {
    let mut blobs = SettingsBlobs::default();
    for key in SettingKey::ALL {
        blobs.set(key, store.read(key.blob_name()).await?);
    }
    Settings::resolve(blobs)
}

pub async fn save_settings(store: &dyn ConfigStore, settings: &Settings) -> Result<(), ApplicationError> {
    settings.validate()?;
    for key in SettingKey::ALL {
        store.write(key.blob_name(), &settings.value_of(key)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pledge_core::domain::settings::Settings;
    use pledge_core::errors::ApplicationError;
    use rust_decimal::Decimal;

    use super::{load_settings, save_settings, SqlConfigStore};
    use crate::repositories::ConfigStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlConfigStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlConfigStore::new(pool)
    }

    #[tokio::test]
    async fn settings_survive_a_save_and_load() {
        let store = store().await;
        let settings = Settings {
            initial_prompt: "Say hello and explain what you track.".to_string(),
            system_prompt: "Watch for promises.".to_string(),
            promise_prompt: "Ask about open promises.".to_string(),
            top_p: Decimal::new(9, 1),
            temperature: Decimal::new(3, 1),
        };

        save_settings(&store, &settings).await.expect("save");
        let loaded = load_settings(&store).await.expect("load");

        assert_eq!(loaded, settings);
        assert_eq!(store.read("top-p.txt").await.expect("read").as_deref(), Some("0.9"));
    }

    #[tokio::test]
    async fn empty_store_is_a_configuration_error() {
        let store = store().await;

        let error = load_settings(&store).await.expect_err("no prompts stored");
        assert!(matches!(error, ApplicationError::Configuration(_)));
    }
}
