//! Inbound messages from any surface become chats on a stored thread.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pledge_core::domain::chat::Chat;
use pledge_core::domain::thread::{normalize_participant, ChatAppend, Thread, ThreadId};
use pledge_core::errors::{ApplicationError, DomainError};
use pledge_db::{read_modify_upsert, Mutation, RepositoryError, ThreadRepository, DEFAULT_MAX_ATTEMPTS};
use thiserror::Error;
use tracing::{debug, info};

/// How an inbound message finds its thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadKey {
    /// A channel or conversation id from the chat platform; created on first use.
    Channel(String),
    /// The participant group; the sender is always part of it.
    Participants(Vec<String>),
    /// A thread that must already exist.
    Existing(ThreadId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub key: ThreadKey,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Set by adapters that already know the message came from a bot.
    pub from_bot: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Appended { thread: Thread, created: bool },
    Redelivered { thread: Thread },
    IgnoredBotEcho,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid message: {0}")]
    Invalid(String),
    #[error("thread `{0}` not found")]
    NotFound(ThreadId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<DomainError> for IngestError {
    fn from(error: DomainError) -> Self {
        Self::Invalid(error.to_string())
    }
}

impl From<IngestError> for ApplicationError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Invalid(message) => {
                ApplicationError::Domain(DomainError::InvariantViolation(message))
            }
            IngestError::NotFound(id) => ApplicationError::NotFound(format!("thread {id}")),
            IngestError::Repository(error) => error.into(),
        }
    }
}

enum Step {
    Appended { created: bool },
    Redelivered,
    Missing,
}

pub struct IngestionService {
    threads: Arc<dyn ThreadRepository>,
    bot_identity: String,
    bot_user_id: Option<String>,
    max_attempts: u32,
}

impl IngestionService {
    pub fn new(threads: Arc<dyn ThreadRepository>, bot_identity: impl Into<String>) -> Self {
        Self { threads, bot_identity: bot_identity.into(), bot_user_id: None, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    pub fn with_bot_user_id(mut self, bot_user_id: Option<String>) -> Self {
        self.bot_user_id = bot_user_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub fn bot_identity(&self) -> &str {
        &self.bot_identity
    }

    fn is_bot_sender(&self, sender: &str) -> bool {
        let sender = normalize_participant(sender);
        sender == normalize_participant(&self.bot_identity)
            || self.bot_user_id.as_deref().is_some_and(|bot| normalize_participant(bot) == sender)
    }

    pub async fn ingest(&self, message: InboundMessage) -> Result<IngestOutcome, IngestError> {
        let sender = message.sender.trim().to_string();
        if sender.is_empty() {
            return Err(IngestError::Invalid("sender is empty".to_string()));
        }
        if message.text.trim().is_empty() {
            return Err(IngestError::Invalid("message text is empty".to_string()));
        }
        if message.from_bot || self.is_bot_sender(&sender) {
            debug!(event_name = "agent.ingest.bot_echo", sender = %sender, "ignoring bot-authored message");
            return Ok(IngestOutcome::IgnoredBotEcho);
        }

        let (id, template) = self.resolve(&message.key, &sender, message.timestamp)?;
        let chat = Chat::human(sender.clone(), message.text, message.timestamp);

        let committed = read_modify_upsert(self.threads.as_ref(), &id, self.max_attempts, |current| {
            let (mut thread, created) = match (current, &template) {
                (Some(thread), _) => (thread, false),
                (None, Some(template)) => (template.clone(), true),
                (None, None) => return Mutation::Keep(Step::Missing),
            };
            let joined = thread.add_participant(&sender, &self.bot_identity);
            match thread.append_chat(chat.clone()) {
                ChatAppend::Appended { .. } => Mutation::Save(thread, Step::Appended { created }),
                ChatAppend::Redelivered if joined => Mutation::Save(thread, Step::Redelivered),
                ChatAppend::Redelivered => Mutation::Keep(Step::Redelivered),
            }
        })
        .await?;

        match (committed.value, committed.thread) {
            (Step::Missing, _) | (_, None) => Err(IngestError::NotFound(id)),
            (Step::Redelivered, Some(thread)) => {
                debug!(event_name = "agent.ingest.redelivered", thread_id = %id, "duplicate delivery ignored");
                Ok(IngestOutcome::Redelivered { thread })
            }
            (Step::Appended { created }, Some(thread)) => {
                info!(
                    event_name = "agent.ingest.appended",
                    thread_id = %id,
                    created,
                    chat_count = thread.chats.len(),
                    "chat appended"
                );
                Ok(IngestOutcome::Appended { thread, created })
            }
        }
    }

    /// Stores an empty thread for a participant group unless one exists.
    /// Returns the stored thread and whether it was created by this call.
    pub async fn create_thread(
        &self,
        participants: &[String],
        now: DateTime<Utc>,
    ) -> Result<(Thread, bool), IngestError> {
        let template = Thread::for_participants(participants, &self.bot_identity, now)?;
        let id = template.id.clone();

        let committed = read_modify_upsert(self.threads.as_ref(), &id, self.max_attempts, |current| match current {
            Some(_) => Mutation::Keep(false),
            None => Mutation::Save(template.clone(), true),
        })
        .await?;

        let created = committed.value;
        let thread = committed.thread.ok_or(IngestError::NotFound(id))?;
        if created {
            info!(event_name = "agent.ingest.thread_created", thread_id = %thread.id, "thread created");
        }
        Ok((thread, created))
    }

    /// The thread id to write to, and the thread to create when none exists.
    fn resolve(
        &self,
        key: &ThreadKey,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<(ThreadId, Option<Thread>), IngestError> {
        match key {
            ThreadKey::Channel(channel) => {
                let id = ThreadId::from_lookup_key(channel)?;
                let template = Thread::new(id.clone(), channel.trim(), now);
                Ok((id, Some(template)))
            }
            ThreadKey::Participants(participants) => {
                let group = participants.iter().map(String::as_str).chain(std::iter::once(sender));
                let template = Thread::for_participants(group, &self.bot_identity, now)?;
                Ok((template.id.clone(), Some(template)))
            }
            ThreadKey::Existing(id) => Ok((id.clone(), None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pledge_core::domain::thread::{Thread, ThreadId};
    use pledge_db::{InMemoryThreadRepository, ThreadRepository};

    use super::{IngestError, IngestOutcome, IngestionService, InboundMessage, ThreadKey};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().expect("timestamp")
    }

    fn service(repo: Arc<InMemoryThreadRepository>) -> IngestionService {
        IngestionService::new(repo, "pledgebot").with_bot_user_id(Some("UBOT".to_string()))
    }

    fn message(key: ThreadKey, sender: &str, text: &str, at: DateTime<Utc>) -> InboundMessage {
        InboundMessage { key, sender: sender.to_string(), text: text.to_string(), timestamp: at, from_bot: false }
    }

    #[tokio::test]
    async fn first_message_creates_the_channel_thread() {
        let repo = Arc::new(InMemoryThreadRepository::default());
        let service = service(Arc::clone(&repo));

        let outcome = service
            .ingest(message(ThreadKey::Channel("C9".to_string()), "U1", "hi all", t0()))
            .await
            .expect("ingest");

        let IngestOutcome::Appended { thread, created } = outcome else {
            panic!("expected an append");
        };
        assert!(created);
        assert_eq!(thread.id, ThreadId("C9".to_string()));
        assert_eq!(thread.channel_key, "C9");
        assert_eq!(thread.participants, vec!["u1".to_string()]);
        assert_eq!(thread.version, 1);
    }

    #[tokio::test]
    async fn later_messages_append_in_timestamp_order() {
        let repo = Arc::new(InMemoryThreadRepository::default());
        let service = service(Arc::clone(&repo));
        let key = ThreadKey::Channel("C9".to_string());

        service.ingest(message(key.clone(), "U1", "second", t0() + Duration::seconds(5))).await.expect("ingest");
        let outcome = service.ingest(message(key, "U2", "first", t0())).await.expect("ingest");

        let IngestOutcome::Appended { thread, created } = outcome else {
            panic!("expected an append");
        };
        assert!(!created);
        let texts: Vec<&str> = thread.chats.iter().map(|chat| chat.message.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(thread.participants, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn redelivery_is_not_appended_twice() {
        let repo = Arc::new(InMemoryThreadRepository::default());
        let service = service(Arc::clone(&repo));
        let inbound = message(ThreadKey::Channel("C9".to_string()), "U1", "hi", t0());

        service.ingest(inbound.clone()).await.expect("first delivery");
        let outcome = service.ingest(inbound).await.expect("second delivery");

        let IngestOutcome::Redelivered { thread } = outcome else {
            panic!("expected a redelivery");
        };
        assert_eq!(thread.chats.len(), 1);
    }

    #[tokio::test]
    async fn bot_echoes_are_dropped() {
        let repo = Arc::new(InMemoryThreadRepository::default());
        let service = service(Arc::clone(&repo));

        for sender in ["UBOT", "PledgeBot"] {
            let outcome = service
                .ingest(message(ThreadKey::Channel("C9".to_string()), sender, "reminder", t0()))
                .await
                .expect("ingest");
            assert_eq!(outcome, IngestOutcome::IgnoredBotEcho);
        }
        assert!(repo.list_ids().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn empty_text_or_sender_is_rejected() {
        let service = service(Arc::new(InMemoryThreadRepository::default()));
        let key = ThreadKey::Channel("C9".to_string());

        assert!(matches!(
            service.ingest(message(key.clone(), " ", "hello", t0())).await,
            Err(IngestError::Invalid(_))
        ));
        assert!(matches!(service.ingest(message(key, "U1", "  ", t0())).await, Err(IngestError::Invalid(_))));
    }

    #[tokio::test]
    async fn existing_key_requires_a_stored_thread() {
        let service = service(Arc::new(InMemoryThreadRepository::default()));

        let error = service
            .ingest(message(ThreadKey::Existing(ThreadId("missing".to_string())), "U1", "hello", t0()))
            .await
            .expect_err("no thread");

        assert!(matches!(error, IngestError::NotFound(_)));
    }

    #[tokio::test]
    async fn participant_threads_are_content_addressed() {
        let repo = Arc::new(InMemoryThreadRepository::default());
        let service = service(Arc::clone(&repo));
        let group = vec!["Bob".to_string(), "alice".to_string(), "pledgebot".to_string()];

        let (created, was_new) = service.create_thread(&group, t0()).await.expect("create");
        let (again, was_new_again) =
            service.create_thread(&["ALICE".to_string(), "bob".to_string()], t0()).await.expect("create again");

        assert!(was_new);
        assert!(!was_new_again);
        assert_eq!(created.id, again.id);
        assert_eq!(created.id, Thread::for_participants(["alice", "bob"], "pledgebot", t0()).expect("thread").id);

        let outcome = service
            .ingest(message(ThreadKey::Participants(vec!["bob".to_string()]), "alice", "hi bob", t0()))
            .await
            .expect("ingest");
        let IngestOutcome::Appended { thread, created } = outcome else {
            panic!("expected an append");
        };
        assert!(!created);
        assert_eq!(thread.id, again.id);
    }
}
