use std::sync::Arc;

use pledge_agent::{
    AgentRuntime, DeadlineScanner, EngineSettings, HttpLlmClient, IngestionService, LlmClient, LlmError,
    PromiseExtractionEngine,
};
use pledge_core::config::{AppConfig, ConfigError, LoadOptions};
use pledge_core::notify::{NotificationError, NotificationSink};
use pledge_core::policy::ResponsePolicy;
use pledge_db::{
    connect_with_config, migrations, ConfigStore, DbPool, SqlConfigStore, SqlThreadRepository, ThreadRepository,
};
use pledge_slack::{sink_from_config, SignatureVerifier};
use thiserror::Error;
use tracing::info;

use crate::api::AppState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("completion backend could not be initialized: {0}")]
    Llm(#[source] LlmError),
    #[error("notification sink could not be initialized: {0}")]
    Notifier(#[source] NotificationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting application bootstrap");

    let db_pool = connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::from_config(&config.llm).map_err(BootstrapError::Llm)?);
    let notifier: Arc<dyn NotificationSink> =
        Arc::from(sink_from_config(&config.slack).map_err(BootstrapError::Notifier)?);
    let threads: Arc<dyn ThreadRepository> = Arc::new(SqlThreadRepository::new(db_pool.clone()));
    let config_store: Arc<dyn ConfigStore> = Arc::new(SqlConfigStore::new(db_pool.clone()));

    let state = assemble(&config, threads, config_store, llm, notifier);
    Ok(Application { config, db_pool, state })
}

/// Wires the services over whichever stores and adapters the caller supplies.
pub fn assemble(
    config: &AppConfig,
    threads: Arc<dyn ThreadRepository>,
    config_store: Arc<dyn ConfigStore>,
    llm: Arc<dyn LlmClient>,
    notifier: Arc<dyn NotificationSink>,
) -> AppState {
    let engine = PromiseExtractionEngine::new(
        Arc::clone(&threads),
        Arc::clone(&config_store),
        llm,
        ResponsePolicy::from(&config.policy),
        EngineSettings::from_config(config),
    );
    let runtime = AgentRuntime::new(Arc::clone(&threads), engine, Arc::clone(&notifier));
    let scanner = DeadlineScanner::from_config(Arc::clone(&threads), notifier, &config.reminders);
    let ingestion = IngestionService::new(Arc::clone(&threads), config.policy.bot_identity.clone())
        .with_bot_user_id(config.slack.bot_user_id.clone());
    let verifier = config.slack.signing_secret.clone().map(SignatureVerifier::new);

    AppState {
        threads,
        config_store,
        ingestion: Arc::new(ingestion),
        runtime: Arc::new(runtime),
        scanner: Arc::new(scanner),
        verifier: verifier.map(Arc::new),
        slack_bot_user_id: config.slack.bot_user_id.clone(),
    }
}
