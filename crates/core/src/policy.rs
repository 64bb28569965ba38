//! Decides whether the bot should speak in a thread right now.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::PolicyConfig;
use crate::domain::thread::Thread;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ResponseDecision {
    AlreadyResponded,
    NoHistory,
    LastChatFromBot,
    Debouncing { remaining_ms: i64 },
    Respond,
}

impl ResponseDecision {
    pub fn should_respond(&self) -> bool {
        matches!(self, Self::Respond)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyResponded => "already_responded",
            Self::NoHistory => "no_history",
            Self::LastChatFromBot => "last_chat_from_bot",
            Self::Debouncing { .. } => "debouncing",
            Self::Respond => "respond",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponsePolicy {
    pub time_buffer: Duration,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self { time_buffer: Duration::seconds(30) }
    }
}

impl From<&PolicyConfig> for ResponsePolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self { time_buffer: config.time_buffer() }
    }
}

impl ResponsePolicy {
    pub fn new(time_buffer: Duration) -> Self {
        Self { time_buffer }
    }

    /// Rules apply in order; the first that matches wins.
    pub fn evaluate(&self, thread: &Thread, now: DateTime<Utc>) -> ResponseDecision {
        if thread.responded_since_last_change {
            return ResponseDecision::AlreadyResponded;
        }

        let Some(last) = thread.last_chat() else {
            return ResponseDecision::NoHistory;
        };

        if last.is_from_bot() {
            return ResponseDecision::LastChatFromBot;
        }

        let quiet_from = last.timestamp + self.time_buffer;
        if quiet_from > now {
            return ResponseDecision::Debouncing {
                remaining_ms: (quiet_from - now).num_milliseconds(),
            };
        }

        ResponseDecision::Respond
    }

    pub fn should_respond(&self, thread: &Thread, now: DateTime<Utc>) -> bool {
        self.evaluate(thread, now).should_respond()
    }
}
