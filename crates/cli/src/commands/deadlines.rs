use std::sync::Arc;

use chrono::Utc;
use pledge_agent::DeadlineScanner;
use pledge_db::SqlThreadRepository;

use crate::commands::{
    current_thread_runtime, load_config, notifier, open_migrated_pool, to_data, CommandResult,
};

pub fn run() -> CommandResult {
    let config = match load_config("deadlines") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let runtime = match current_thread_runtime("deadlines") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;
        let scanner = DeadlineScanner::from_config(
            Arc::new(SqlThreadRepository::new(pool.clone())),
            notifier(&config)?,
            &config.reminders,
        );
        let report = scanner.scan(Utc::now()).await;
        pool.close().await;
        report.map_err(|error| ("operation", error.to_string(), 6u8))
    });

    match result {
        Ok(report) => CommandResult::success_with_data(
            "deadlines",
            format!(
                "scanned {} threads: {} reminders sent, {} promises expired",
                report.threads_scanned, report.reminders_sent, report.promises_expired
            ),
            to_data(&report),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("deadlines", error_class, message, exit_code)
        }
    }
}
