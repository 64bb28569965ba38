use std::sync::Arc;

use chrono::{DateTime, Utc};
use pledge_core::notify::NotificationSink;
use pledge_db::ThreadRepository;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::extraction::{EngineError, ExtractionReport, PromiseExtractionEngine};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub threads_scanned: usize,
    pub not_due: usize,
    pub applied: usize,
    pub superseded: usize,
    pub abandoned: usize,
    pub failed: usize,
    pub messages_posted: usize,
    pub delivery_failures: usize,
}

/// Runs the extraction engine over every stored thread and delivers the
/// resulting bot messages.
pub struct AgentRuntime {
    threads: Arc<dyn ThreadRepository>,
    engine: PromiseExtractionEngine,
    notifier: Arc<dyn NotificationSink>,
}

impl AgentRuntime {
    pub fn new(
        threads: Arc<dyn ThreadRepository>,
        engine: PromiseExtractionEngine,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { threads, engine, notifier }
    }

    pub fn engine(&self) -> &PromiseExtractionEngine {
        &self.engine
    }

    /// A configuration error stops the sweep since every thread would hit it.
    /// Any other per-thread failure is counted and the sweep moves on.
    pub async fn check_chats(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let ids = self.threads.list_ids().await?;
        let mut report = SweepReport { threads_scanned: ids.len(), ..SweepReport::default() };

        for id in ids {
            match self.engine.run(&id, now).await {
                Ok(ExtractionReport::NotDue { .. }) | Ok(ExtractionReport::Missing) => report.not_due += 1,
                Ok(ExtractionReport::Superseded) => report.superseded += 1,
                Ok(ExtractionReport::Abandoned { .. }) => report.abandoned += 1,
                Ok(ExtractionReport::Applied { channel_key, outcome, .. }) => {
                    report.applied += 1;
                    if let Some(message) = outcome.bot_message {
                        match self.notifier.post(&channel_key, &message).await {
                            Ok(()) => report.messages_posted += 1,
                            Err(delivery_error) => {
                                report.delivery_failures += 1;
                                warn!(
                                    event_name = "agent.sweep.delivery_failed",
                                    thread_id = %id,
                                    channel_key = %channel_key,
                                    error = %delivery_error,
                                    "bot reply stored but not delivered"
                                );
                            }
                        }
                    }
                }
                Err(EngineError::Configuration(config_error)) => {
                    error!(
                        event_name = "agent.sweep.misconfigured",
                        error = %config_error,
                        "chat sweep stopped on a configuration error"
                    );
                    return Err(EngineError::Configuration(config_error));
                }
                Err(EngineError::Repository(repo_error)) => {
                    report.failed += 1;
                    warn!(
                        event_name = "agent.sweep.thread_failed",
                        thread_id = %id,
                        error = %repo_error,
                        "thread skipped this sweep"
                    );
                }
            }
        }

        info!(
            event_name = "agent.sweep.completed",
            threads_scanned = report.threads_scanned,
            applied = report.applied,
            abandoned = report.abandoned,
            failed = report.failed,
            messages_posted = report.messages_posted,
            "chat sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
    use pledge_core::domain::chat::Chat;
    use pledge_core::domain::thread::{Thread, ThreadId};
    use pledge_core::notify::{NotificationError, RecordingNotificationSink};
    use pledge_core::policy::ResponsePolicy;
    use pledge_db::{InMemoryConfigStore, InMemoryThreadRepository, ThreadRepository};

    use super::{AgentRuntime, SweepReport};
    use crate::extraction::{EngineSettings, PromiseExtractionEngine};
    use crate::llm::{LlmError, ScriptedLlmClient};

    const REPLY: &str = r#"{"response": "Hi both, I'll keep track of any promises here.", "confirmed": false}"#;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().expect("timestamp")
    }

    async fn repo_with(channels: &[&str]) -> Arc<InMemoryThreadRepository> {
        let repo = Arc::new(InMemoryThreadRepository::default());
        for channel in channels {
            let mut thread = Thread::new(ThreadId(channel.to_string()), *channel, t0());
            thread.append_chat(Chat::human("alice", "morning all", t0()));
            repo.upsert(thread).await.expect("seed");
        }
        repo
    }

    fn runtime(
        repo: Arc<InMemoryThreadRepository>,
        llm: ScriptedLlmClient,
        notifier: Arc<RecordingNotificationSink>,
    ) -> AgentRuntime {
        let store = Arc::new(InMemoryConfigStore::with_blobs([
            ("initial-system-prompt.txt", "Introduce yourself."),
            ("system-prompt.txt", "Listen for promises."),
            ("promise-prompt.txt", "Follow up."),
        ]));
        let settings = EngineSettings {
            bot_identity: "pledgebot".to_string(),
            default_offset: FixedOffset::east_opt(0).expect("offset"),
            llm_timeout: StdDuration::from_secs(5),
            max_tokens: 200,
            max_attempts: 4,
        };
        let engine = PromiseExtractionEngine::new(
            repo.clone(),
            store,
            Arc::new(llm),
            ResponsePolicy::default(),
            settings,
        );
        AgentRuntime::new(repo, engine, notifier)
    }

    #[tokio::test]
    async fn sweep_replies_and_delivers_to_the_thread_channel() {
        let repo = repo_with(&["C1"]).await;
        let notifier = Arc::new(RecordingNotificationSink::default());
        let runtime = runtime(Arc::clone(&repo), ScriptedLlmClient::replying(REPLY), Arc::clone(&notifier));

        let report = runtime.check_chats(t0() + Duration::minutes(1)).await.expect("sweep");

        assert_eq!(report.applied, 1);
        assert_eq!(report.messages_posted, 1);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_key, "C1");
        assert!(sent[0].text.starts_with("Hi both"));
    }

    #[tokio::test]
    async fn one_failing_thread_does_not_fail_the_batch() {
        let repo = repo_with(&["C1", "C2"]).await;
        let notifier = Arc::new(RecordingNotificationSink::default());
        let llm = ScriptedLlmClient::new([
            Err(LlmError::Status { status: 500, body: "boom".to_string() }),
            Ok(REPLY.to_string()),
        ]);
        let runtime = runtime(repo, llm, notifier);

        let report = runtime.check_chats(t0() + Duration::minutes(1)).await.expect("sweep");

        assert_eq!(
            report,
            SweepReport {
                threads_scanned: 2,
                applied: 1,
                abandoned: 1,
                messages_posted: 1,
                ..SweepReport::default()
            }
        );
    }

    #[tokio::test]
    async fn delivery_failure_keeps_the_stored_reply() {
        let repo = repo_with(&["C1"]).await;
        let notifier =
            Arc::new(RecordingNotificationSink::failing(NotificationError::Rejected("not_in_channel".to_string())));
        let runtime = runtime(Arc::clone(&repo), ScriptedLlmClient::replying(REPLY), notifier);

        let report = runtime.check_chats(t0() + Duration::minutes(1)).await.expect("sweep");

        assert_eq!(report.delivery_failures, 1);
        let thread = repo.find_by_id(&ThreadId("C1".to_string())).await.expect("find").expect("thread");
        assert!(thread.responded_since_last_change);
        assert!(thread.last_chat().expect("chat").is_from_bot());
    }
}
