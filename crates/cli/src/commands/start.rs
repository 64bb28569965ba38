use pledge_agent::HttpLlmClient;

use crate::commands::{
    current_thread_runtime, load_config, notifier, open_migrated_pool, CommandResult, Failure,
};

/// Preflight for `pledge-server`: everything bootstrap needs, without binding
/// a listener or starting the schedulers.
pub fn run() -> CommandResult {
    let config = match load_config("start") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let runtime = match current_thread_runtime("start") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;
        pool.close().await;

        let llm = HttpLlmClient::from_config(&config.llm)
            .map_err(|error| ("config_validation", error.to_string(), 2u8))?;
        notifier(&config)?;
        Ok::<String, Failure>(llm.endpoint().to_string())
    });

    match result {
        Ok(endpoint) => {
            let delivery = if config.slack.bot_token.is_some() { "slack web api" } else { "log only" };
            CommandResult::success(
                "start",
                format!(
                    "preflight passed: database ready, completions via {:?} `{}` at {endpoint}, delivery {delivery}",
                    config.llm.provider, config.llm.model
                ),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("start", error_class, message, exit_code)
        }
    }
}
