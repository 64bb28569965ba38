use std::sync::Arc;

use chrono::Utc;
use pledge_agent::{AgentRuntime, EngineSettings, HttpLlmClient, PromiseExtractionEngine};
use pledge_core::config::AppConfig;
use pledge_core::policy::ResponsePolicy;
use pledge_db::{DbPool, SqlConfigStore, SqlThreadRepository, ThreadRepository};

use crate::commands::{
    current_thread_runtime, load_config, notifier, open_migrated_pool, to_data, CommandResult, Failure,
};

pub fn run() -> CommandResult {
    let config = match load_config("sweep") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let runtime = match current_thread_runtime("sweep") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;
        let agent = agent_runtime(&config, pool.clone())?;
        let report = agent.check_chats(Utc::now()).await;
        pool.close().await;
        report.map_err(|error| ("operation", error.to_string(), 6u8))
    });

    match result {
        Ok(report) => CommandResult::success_with_data(
            "sweep",
            format!(
                "scanned {} threads: {} applied, {} posted, {} failed",
                report.threads_scanned, report.applied, report.messages_posted, report.failed
            ),
            to_data(&report),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sweep", error_class, message, exit_code)
        }
    }
}

fn agent_runtime(config: &AppConfig, pool: DbPool) -> Result<AgentRuntime, Failure> {
    let llm = HttpLlmClient::from_config(&config.llm)
        .map_err(|error| ("config_validation", error.to_string(), 2u8))?;
    let threads: Arc<dyn ThreadRepository> = Arc::new(SqlThreadRepository::new(pool.clone()));

    let engine = PromiseExtractionEngine::new(
        Arc::clone(&threads),
        Arc::new(SqlConfigStore::new(pool)),
        Arc::new(llm),
        ResponsePolicy::from(&config.policy),
        EngineSettings::from_config(config),
    );
    Ok(AgentRuntime::new(threads, engine, notifier(config)?))
}
