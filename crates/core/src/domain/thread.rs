use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::chat::Chat;
use crate::domain::promise::{Promise, PromiseId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    /// Content-addressed id for a participant group: the SHA-256 of the sorted,
    /// de-duplicated, lower-cased non-bot identities concatenated together.
    pub fn from_participants<I, S>(participants: I, bot_identity: &str) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = normalize_participants(participants, bot_identity);
        if normalized.is_empty() {
            return Err(DomainError::InvariantViolation(
                "a thread needs at least one non-bot participant".to_string(),
            ));
        }

        let digest = Sha256::digest(normalized.concat().as_bytes());
        Ok(Self(digest.iter().map(|byte| format!("{byte:02x}")).collect()))
    }

    pub fn from_lookup_key(key: &str) -> Result<Self, DomainError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(DomainError::InvariantViolation("thread lookup key is empty".to_string()));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_participant(identity: &str) -> String {
    identity.trim().to_lowercase()
}

pub fn normalize_participants<I, S>(participants: I, bot_identity: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let bot = normalize_participant(bot_identity);
    let mut normalized: Vec<String> = participants
        .into_iter()
        .map(|participant| normalize_participant(participant.as_ref()))
        .filter(|participant| !participant.is_empty() && *participant != bot)
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAppend {
    Appended { position: usize },
    Redelivered,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub channel_key: String,
    pub participants: Vec<String>,
    pub chats: Vec<Chat>,
    pub promises: Vec<Promise>,
    pub responded_since_last_change: bool,
    /// Optimistic-concurrency token; zero until the thread is first stored.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(id: ThreadId, channel_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            channel_key: channel_key.into(),
            participants: Vec::new(),
            chats: Vec::new(),
            promises: Vec::new(),
            responded_since_last_change: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A thread addressed by its participant hash; replies go to the same key.
    pub fn for_participants<I, S>(
        participants: I,
        bot_identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let participants = normalize_participants(participants, bot_identity);
        let id = ThreadId::from_participants(&participants, bot_identity)?;
        let mut thread = Self::new(id.clone(), id.0, now);
        thread.participants = participants;
        Ok(thread)
    }

    pub fn is_stored(&self) -> bool {
        self.version > 0
    }

    /// Returns true when the identity was not yet a participant.
    pub fn add_participant(&mut self, identity: &str, bot_identity: &str) -> bool {
        let normalized = normalize_participant(identity);
        if normalized.is_empty() || normalized == normalize_participant(bot_identity) {
            return false;
        }

        match self.participants.binary_search(&normalized) {
            Ok(_) => false,
            Err(position) => {
                self.participants.insert(position, normalized);
                true
            }
        }
    }

    /// Inserts the chat at its timestamp position, keeping timestamps strictly
    /// increasing. Colliding timestamps are nudged forward a microsecond at a
    /// time. Human chats clear the responded flag and bot chats set it.
    pub fn append_chat(&mut self, mut chat: Chat) -> ChatAppend {
        // A chat is nudged at most once per stored chat.
        let nudge_span = Duration::microseconds(self.chats.len() as i64);
        if self.chats.iter().any(|existing| existing.is_redelivery_of(&chat, nudge_span)) {
            return ChatAppend::Redelivered;
        }

        while self.chats.iter().any(|existing| existing.timestamp == chat.timestamp) {
            chat.timestamp += Duration::microseconds(1);
        }

        self.responded_since_last_change = chat.is_from_bot();
        let position = self.chats.partition_point(|existing| existing.timestamp < chat.timestamp);
        self.chats.insert(position, chat);
        ChatAppend::Appended { position }
    }

    pub fn last_chat(&self) -> Option<&Chat> {
        self.chats.last()
    }

    pub fn last_bot_chat(&self) -> Option<&Chat> {
        self.chats.iter().rev().find(|chat| chat.is_from_bot())
    }

    pub fn latest_human_chat_at(&self) -> Option<DateTime<Utc>> {
        self.chats.iter().rev().find(|chat| !chat.is_from_bot()).map(|chat| chat.timestamp)
    }

    pub fn has_bot_chat(&self) -> bool {
        self.chats.iter().any(Chat::is_from_bot)
    }

    pub fn open_promises(&self) -> impl Iterator<Item = &Promise> {
        self.promises.iter().filter(|promise| promise.is_open())
    }

    pub fn promise_mut(&mut self, id: PromiseId) -> Option<&mut Promise> {
        self.promises.iter_mut().find(|promise| promise.id == id)
    }

    pub fn mark_responded(&mut self) {
        self.responded_since_last_change = true;
    }

    /// Distinct chat authors other than the bot, in first-seen order.
    pub fn human_authors(&self) -> Vec<String> {
        let mut authors: Vec<String> = Vec::new();
        for chat in self.chats.iter().filter(|chat| !chat.is_from_bot()) {
            if !authors.iter().any(|author| author.eq_ignore_ascii_case(&chat.author)) {
                authors.push(chat.author.clone());
            }
        }
        authors
    }
}
