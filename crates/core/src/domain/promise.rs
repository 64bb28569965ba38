use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromiseId(pub Uuid);

impl PromiseId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }
}

impl std::fmt::Display for PromiseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromiseStatus {
    Proposed,
    Confirmed,
    Fulfilled,
    Canceled,
    Expired,
}

impl PromiseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Confirmed => "confirmed",
            Self::Fulfilled => "fulfilled",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proposed" => Some(Self::Proposed),
            "confirmed" => Some(Self::Confirmed),
            "fulfilled" => Some(Self::Fulfilled),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseTransition {
    pub from: PromiseStatus,
    pub to: PromiseStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The fields a participant agreed on, before the deadline has been resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseDraft {
    pub description: String,
    pub promisor: String,
    pub promise_holder: String,
    pub deadline_text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub id: PromiseId,
    pub description: String,
    pub deadline_text: String,
    pub deadline: DateTime<Utc>,
    pub promisor: String,
    pub promise_holder: String,
    pub status: PromiseStatus,
    #[serde(default)]
    pub reminded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<PromiseTransition>,
    pub created_at: DateTime<Utc>,
}

impl Promise {
    /// Records a promise both parties agreed on. The log keeps the implicit
    /// `Proposed -> Confirmed` step so every promise has a full history.
    pub fn confirmed(draft: PromiseDraft, deadline: DateTime<Utc>, at: DateTime<Utc>) -> Self {
        let mut promise = Self {
            id: PromiseId::generate(),
            description: draft.description,
            deadline_text: draft.deadline_text,
            deadline,
            promisor: draft.promisor,
            promise_holder: draft.promise_holder,
            status: PromiseStatus::Proposed,
            reminded_at: None,
            transitions: Vec::new(),
            created_at: at,
        };
        promise.status = PromiseStatus::Confirmed;
        promise.transitions.push(PromiseTransition {
            from: PromiseStatus::Proposed,
            to: PromiseStatus::Confirmed,
            reason: "confirmed in conversation".to_string(),
            at,
        });
        promise
    }

    pub fn is_open(&self) -> bool {
        self.status == PromiseStatus::Confirmed
    }

    pub fn can_transition_to(&self, next: PromiseStatus) -> bool {
        matches!(
            (self.status, next),
            (PromiseStatus::Proposed, PromiseStatus::Confirmed)
                | (PromiseStatus::Proposed, PromiseStatus::Canceled)
                | (PromiseStatus::Confirmed, PromiseStatus::Fulfilled)
                | (PromiseStatus::Confirmed, PromiseStatus::Canceled)
                | (PromiseStatus::Confirmed, PromiseStatus::Expired)
                | (PromiseStatus::Expired, PromiseStatus::Fulfilled)
        )
    }

    pub fn transition_to(
        &mut self,
        next: PromiseStatus,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::InvalidPromiseTransition { from: self.status, to: next });
        }

        self.transitions.push(PromiseTransition {
            from: self.status,
            to: next,
            reason: reason.into(),
            at,
        });
        self.status = next;
        Ok(())
    }

    /// Open, not yet reminded, and due inside `[now, now + lookahead]`.
    pub fn needs_reminder(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        self.is_open()
            && self.reminded_at.is_none()
            && self.deadline >= now
            && self.deadline <= now + lookahead
    }

    pub fn is_past_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.is_open() && self.deadline + grace < now
    }

    pub fn mark_reminded(&mut self, at: DateTime<Utc>) {
        self.reminded_at = Some(at);
    }

    /// Loose match used when a completion refers to a promise by its text.
    pub fn describes(&self, description: &str) -> bool {
        let wanted = description.trim();
        !wanted.is_empty() && self.description.trim().eq_ignore_ascii_case(wanted)
    }
}
