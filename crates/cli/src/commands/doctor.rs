use pledge_agent::HttpLlmClient;
use pledge_core::config::{AppConfig, LoadOptions};
use pledge_core::errors::ApplicationError;
use pledge_db::{connect_with_config, load_settings, SqlConfigStore};
use secrecy::ExposeSecret;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_slack_readiness(&config));
            checks.push(check_completion_backend(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in ["slack_readiness", "completion_backend", "database_connectivity", "stored_prompts"] {
                checks.push(DoctorCheck::skipped(name, "configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Running without a bot token is a supported log-only mode; a token that is
/// present but blank is a misconfiguration.
fn check_slack_readiness(config: &AppConfig) -> DoctorCheck {
    let slack = &config.slack;
    let blank = |secret: &secrecy::SecretString| secret.expose_secret().trim().is_empty();

    if slack.bot_token.as_ref().is_some_and(blank) {
        return DoctorCheck::fail("slack_readiness", "slack.bot_token is set but empty");
    }
    if slack.signing_secret.as_ref().is_some_and(blank) {
        return DoctorCheck::fail("slack_readiness", "slack.signing_secret is set but empty");
    }

    let delivery = if slack.bot_token.is_some() {
        format!("posting through {}", slack.api_base_url)
    } else {
        "bot token unset, outbound messages are only logged".to_string()
    };
    let webhooks = if slack.signing_secret.is_some() {
        "webhook signatures verified"
    } else {
        "webhook signatures not verified"
    };
    DoctorCheck::pass("slack_readiness", format!("{delivery}; {webhooks}"))
}

fn check_completion_backend(config: &AppConfig) -> DoctorCheck {
    match HttpLlmClient::from_config(&config.llm) {
        Ok(client) => DoctorCheck::pass(
            "completion_backend",
            format!("{:?} model `{}` at {}", config.llm.provider, config.llm.model, client.endpoint()),
        ),
        Err(error) => DoctorCheck::fail("completion_backend", error.to_string()),
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck::fail(
                    "database_connectivity",
                    format!("failed to initialize async runtime: {error}"),
                ),
                DoctorCheck::skipped("stored_prompts", "the async runtime did not start"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck::fail(
                        "database_connectivity",
                        format!("failed to connect to database: {error}"),
                    ),
                    DoctorCheck::skipped("stored_prompts", "the database is unreachable"),
                ];
            }
        };

        let prompts = match load_settings(&SqlConfigStore::new(pool.clone())).await {
            Ok(settings) => DoctorCheck::pass(
                "stored_prompts",
                format!(
                    "initial, steady-state and promise prompts stored (top_p {}, temperature {})",
                    settings.top_p, settings.temperature
                ),
            ),
            Err(ApplicationError::Configuration(message)) => DoctorCheck::fail("stored_prompts", message),
            Err(error) => DoctorCheck::fail(
                "stored_prompts",
                format!("could not read settings ({error}); run `pledge migrate` first"),
            ),
        };
        pool.close().await;

        vec![
            DoctorCheck::pass("database_connectivity", format!("connected using `{}`", config.database.url)),
            prompts,
        ]
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{render_human, CheckStatus, DoctorCheck, DoctorReport};

    #[test]
    fn human_rendering_marks_each_check() {
        let report = DoctorReport {
            overall_status: CheckStatus::Fail,
            summary: "doctor: one or more readiness checks failed".to_string(),
            checks: vec![
                DoctorCheck::pass("config_validation", "configuration loaded and validated"),
                DoctorCheck::fail("stored_prompts", "missing prompt `promise-prompt.txt`"),
                DoctorCheck::skipped("database_connectivity", "configuration did not load"),
            ],
        };

        let rendered = render_human(&report);

        assert!(rendered.contains("- [ok] config_validation"));
        assert!(rendered.contains("- [fail] stored_prompts: missing prompt"));
        assert!(rendered.contains("- [skip] database_connectivity: skipped because configuration did not load"));
    }
}
