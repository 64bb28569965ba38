//! One extraction cycle for one thread: snapshot, completion, fold.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, FixedOffset, Utc};
use pledge_core::config::AppConfig;
use pledge_core::domain::settings::PromptKind;
use pledge_core::domain::thread::{Thread, ThreadId};
use pledge_core::errors::ApplicationError;
use pledge_core::extraction::{fold_extraction, parse_extraction, FoldContext, FoldOutcome};
use pledge_core::policy::{ResponseDecision, ResponsePolicy};
use pledge_db::{
    load_settings, read_modify_upsert, ConfigStore, Mutation, RepositoryError, ThreadRepository,
    DEFAULT_MAX_ATTEMPTS,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::llm::{LlmClient, RetryPolicy};
use crate::prompt::build_request;

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub bot_identity: String,
    pub default_offset: FixedOffset,
    pub llm_timeout: StdDuration,
    pub max_tokens: u32,
    pub max_attempts: u32,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bot_identity: config.policy.bot_identity.clone(),
            default_offset: config.reminders.default_offset(),
            llm_timeout: RetryPolicy::from_config(&config.llm)
                .total_budget(StdDuration::from_secs(config.llm.timeout_secs.max(1))),
            max_tokens: config.llm.max_tokens,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExtractionReport {
    NotDue { decision: ResponseDecision },
    Missing,
    /// The completion or its parse failed; nothing was written.
    Abandoned { reason: String },
    /// A newer human chat or a concurrent worker got there first.
    Superseded,
    Applied { channel_key: String, prompt: PromptKind, outcome: FoldOutcome },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(ApplicationError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct PromiseExtractionEngine {
    threads: Arc<dyn ThreadRepository>,
    config_store: Arc<dyn ConfigStore>,
    llm: Arc<dyn LlmClient>,
    policy: ResponsePolicy,
    settings: EngineSettings,
}

impl PromiseExtractionEngine {
    pub fn new(
        threads: Arc<dyn ThreadRepository>,
        config_store: Arc<dyn ConfigStore>,
        llm: Arc<dyn LlmClient>,
        policy: ResponsePolicy,
        settings: EngineSettings,
    ) -> Self {
        Self { threads, config_store, llm, policy, settings }
    }

    pub fn policy(&self) -> &ResponsePolicy {
        &self.policy
    }

    pub async fn run(&self, id: &ThreadId, now: DateTime<Utc>) -> Result<ExtractionReport, EngineError> {
        let Some(snapshot) = self.threads.find_by_id(id).await? else {
            return Ok(ExtractionReport::Missing);
        };

        let decision = self.policy.evaluate(&snapshot, now);
        if !decision.should_respond() {
            return Ok(ExtractionReport::NotDue { decision });
        }

        let settings = load_settings(self.config_store.as_ref()).await.map_err(EngineError::Configuration)?;
        let (prompt, request) =
            build_request(&snapshot, &settings, &self.settings.bot_identity, now, self.settings.max_tokens)
                .map_err(|error| EngineError::Configuration(ApplicationError::Configuration(error.to_string())))?;

        debug!(
            event_name = "agent.extraction.requested",
            thread_id = %id,
            prompt = prompt.as_str(),
            chat_count = snapshot.chats.len(),
            "requesting completion"
        );

        let completion = match tokio::time::timeout(self.settings.llm_timeout, self.llm.complete(&request)).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(error)) => return Ok(self.abandon(id, error.to_string())),
            Err(_) => {
                return Ok(self.abandon(
                    id,
                    format!("completion timed out after {}s", self.settings.llm_timeout.as_secs()),
                ))
            }
        };

        let result = match parse_extraction(&completion) {
            Ok(result) => result,
            Err(error) => return Ok(self.abandon(id, error.to_string())),
        };

        let watermark = human_watermark(&snapshot);
        let context = FoldContext {
            bot_identity: &self.settings.bot_identity,
            default_offset: self.settings.default_offset,
            now,
        };

        let committed = read_modify_upsert(self.threads.as_ref(), id, self.settings.max_attempts, |current| {
            let Some(mut thread) = current else {
                return Mutation::Keep(None);
            };
            if thread.responded_since_last_change || human_watermark(&thread) != watermark {
                return Mutation::Keep(None);
            }
            let outcome = fold_extraction(&mut thread, &result, &context);
            Mutation::Save(thread, Some(outcome))
        })
        .await?;

        let Some(outcome) = committed.value else {
            info!(
                event_name = "agent.extraction.superseded",
                thread_id = %id,
                "thread changed during completion; outcome discarded"
            );
            return Ok(ExtractionReport::Superseded);
        };

        if let Some(deadline_text) = &outcome.rejected_deadline {
            warn!(
                event_name = "agent.extraction.deadline_rejected",
                thread_id = %id,
                deadline_text = %deadline_text,
                "promise deadline could not be parsed; asked for clarification"
            );
        }
        if outcome.unresolved_reference {
            warn!(
                event_name = "agent.extraction.unresolved_reference",
                thread_id = %id,
                "completion referred to a promise that is not open in this thread"
            );
        }
        info!(
            event_name = "agent.extraction.applied",
            thread_id = %id,
            prompt = prompt.as_str(),
            replied = outcome.bot_message.is_some(),
            promise_created = outcome.created_promise.is_some(),
            promises_transitioned = outcome.transitioned.len(),
            "extraction folded into thread"
        );

        Ok(ExtractionReport::Applied { channel_key: snapshot.channel_key, prompt, outcome })
    }

    fn abandon(&self, id: &ThreadId, reason: String) -> ExtractionReport {
        warn!(
            event_name = "agent.extraction.abandoned",
            thread_id = %id,
            reason = %reason,
            "extraction cycle abandoned; thread left unchanged"
        );
        ExtractionReport::Abandoned { reason }
    }
}

/// Number of human chats and the newest human timestamp. Any ingest since the
/// snapshot moves at least one of them.
fn human_watermark(thread: &Thread) -> (usize, Option<DateTime<Utc>>) {
    let count = thread.chats.iter().filter(|chat| !chat.is_from_bot()).count();
    (count, thread.latest_human_chat_at())
}
