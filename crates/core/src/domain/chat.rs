use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub Uuid);

impl ChatId {
    /// Sentinel carried by every bot-authored chat.
    pub const BOT: ChatId = ChatId(Uuid::nil());

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_bot(&self) -> bool {
        self.0.is_nil()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

impl Chat {
    pub fn human(
        author: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ChatId::generate(),
            message: message.into(),
            author: author.into(),
            timestamp,
        }
    }

    pub fn bot(
        bot_identity: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self { id: ChatId::BOT, message: message.into(), author: bot_identity.into(), timestamp }
    }

    pub fn is_from_bot(&self) -> bool {
        self.id.is_bot()
    }

    /// True when `incoming` repeats this stored chat: same author and text,
    /// sent at this chat's instant or up to `nudge_span` before it (a stored
    /// chat may have been moved forward to break a timestamp tie).
    pub fn is_redelivery_of(&self, incoming: &Chat, nudge_span: Duration) -> bool {
        self.timestamp >= incoming.timestamp
            && self.timestamp - incoming.timestamp <= nudge_span
            && self.message == incoming.message
            && self.author.eq_ignore_ascii_case(&incoming.author)
    }
}
