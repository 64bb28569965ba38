//! Structured completion results and how they fold into a thread.
//!
//! Parsing is strict: a result either decodes into an [`ExtractionResult`] or
//! the whole cycle is abandoned, so a half-understood reply never reaches the
//! stored thread.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::deadline::{clarification_message, parse_deadline};
use crate::domain::chat::Chat;
use crate::domain::promise::{Promise, PromiseDraft, PromiseId, PromiseStatus};
use crate::domain::thread::Thread;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("completion did not contain a JSON object")]
    NoJson,
    #[error("completion JSON is malformed: {0}")]
    Malformed(String),
    #[error("completion result is missing `{0}`")]
    MissingField(&'static str),
    #[error("completion result has unknown status `{0}`")]
    UnknownStatus(String),
    #[error("completion result has status `{status}` but `confirmed` is {confirmed}")]
    Contradictory { status: String, confirmed: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PromiseReference {
    pub id: Option<PromiseId>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ExtractionIntent {
    NeedsClarification,
    Confirmed(PromiseDraft),
    Fulfilled(PromiseReference),
    Canceled(PromiseReference),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    pub response: String,
    pub intent: ExtractionIntent,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    #[serde(default)]
    promise: Option<String>,
    #[serde(default)]
    promisor: Option<String>,
    #[serde(default, alias = "promiseHolder")]
    promise_holder: Option<String>,
    #[serde(default)]
    deadline: Option<String>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    confirmed: Option<bool>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "promiseId")]
    promise_id: Option<String>,
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolLike {
        Bool(bool),
        Text(String),
    }

    match Option::<BoolLike>::deserialize(deserializer)? {
        None => Ok(None),
        Some(BoolLike::Bool(value)) => Ok(Some(value)),
        Some(BoolLike::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(Some(true)),
            "false" | "no" | "" => Ok(Some(false)),
            other => Err(serde::de::Error::custom(format!("`{other}` is not a boolean"))),
        },
    }
}

/// Pulls the JSON object out of a completion that may wrap it in a fenced
/// block or surrounding prose.
pub fn locate_json(completion: &str) -> Option<&str> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub fn parse_extraction(completion: &str) -> Result<ExtractionResult, ExtractionError> {
    let json = locate_json(completion).ok_or(ExtractionError::NoJson)?;
    let raw: RawAnswer =
        serde_json::from_str(json).map_err(|error| ExtractionError::Malformed(error.to_string()))?;

    let response = raw.response.clone().ok_or(ExtractionError::MissingField("response"))?;
    let confirmed = raw.confirmed.ok_or(ExtractionError::MissingField("confirmed"))?;

    let status = match raw.status.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        Some(status) => status.to_ascii_lowercase(),
        None if confirmed => "confirmed".to_string(),
        None => "needs_clarification".to_string(),
    };

    // Only `confirmed: true` may create a promise, and it may do nothing else.
    let creates_promise = status == "confirmed";
    let known = matches!(
        status.as_str(),
        "needs_clarification" | "none" | "pending" | "confirmed" | "fulfilled" | "canceled" | "cancelled"
    );
    if known && creates_promise != confirmed {
        return Err(ExtractionError::Contradictory { status, confirmed });
    }

    let intent = match status.as_str() {
        "needs_clarification" | "none" | "pending" => ExtractionIntent::NeedsClarification,
        "confirmed" => ExtractionIntent::Confirmed(PromiseDraft {
            description: required(raw.promise, "promise")?,
            promisor: required(raw.promisor, "promisor")?,
            promise_holder: required(raw.promise_holder, "promise_holder")?,
            deadline_text: required(raw.deadline, "deadline")?,
        }),
        "fulfilled" | "canceled" | "cancelled" => {
            let reference = PromiseReference {
                id: raw.promise_id.as_deref().and_then(PromiseId::parse),
                description: raw.promise.filter(|value| !value.trim().is_empty()),
            };
            if status == "fulfilled" {
                ExtractionIntent::Fulfilled(reference)
            } else {
                ExtractionIntent::Canceled(reference)
            }
        }
        other => return Err(ExtractionError::UnknownStatus(other.to_string())),
    };

    Ok(ExtractionResult { response, intent })
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ExtractionError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ExtractionError::MissingField(field))
}

#[derive(Clone, Debug)]
pub struct FoldContext<'a> {
    pub bot_identity: &'a str,
    pub default_offset: FixedOffset,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FoldOutcome {
    /// Text appended as a bot chat and to be delivered to the channel.
    pub bot_message: Option<String>,
    pub created_promise: Option<PromiseId>,
    pub transitioned: Vec<(PromiseId, PromiseStatus)>,
    pub rejected_deadline: Option<String>,
    pub unresolved_reference: bool,
}

/// Applies a parsed result to the thread and marks it responded.
pub fn fold_extraction(
    thread: &mut Thread,
    result: &ExtractionResult,
    context: &FoldContext<'_>,
) -> FoldOutcome {
    let mut outcome = FoldOutcome::default();
    let mut reply = usable_reply(thread, &result.response);

    match &result.intent {
        ExtractionIntent::NeedsClarification => {}
        ExtractionIntent::Confirmed(draft) => {
            let duplicate = thread.open_promises().any(|promise| {
                promise.describes(&draft.description)
                    && promise.promisor.eq_ignore_ascii_case(&draft.promisor)
            });
            if !duplicate {
                match parse_deadline(&draft.deadline_text, context.default_offset) {
                    Ok(deadline) => {
                        let promise = Promise::confirmed(draft.clone(), deadline, context.now);
                        outcome.created_promise = Some(promise.id);
                        thread.promises.push(promise);
                    }
                    Err(_) => {
                        outcome.rejected_deadline = Some(draft.deadline_text.clone());
                        reply = Some(clarification_message(&draft.deadline_text));
                    }
                }
            }
        }
        ExtractionIntent::Fulfilled(reference) => {
            close_promise(thread, reference, PromiseStatus::Fulfilled, context.now, &mut outcome);
        }
        ExtractionIntent::Canceled(reference) => {
            close_promise(thread, reference, PromiseStatus::Canceled, context.now, &mut outcome);
        }
    }

    if let Some(message) = reply {
        let timestamp = match thread.last_chat() {
            Some(last) if last.timestamp >= context.now => last.timestamp + Duration::microseconds(1),
            _ => context.now,
        };
        thread.append_chat(Chat::bot(context.bot_identity, message.clone(), timestamp));
        outcome.bot_message = Some(message);
    }

    thread.mark_responded();
    outcome
}

fn usable_reply(thread: &Thread, response: &str) -> Option<String> {
    let response = response.trim();
    if response.is_empty() || response.to_ascii_lowercase().contains("already confirmed") {
        return None;
    }
    if thread.last_bot_chat().is_some_and(|chat| chat.message.trim() == response) {
        return None;
    }
    Some(response.to_string())
}

fn close_promise(
    thread: &mut Thread,
    reference: &PromiseReference,
    next: PromiseStatus,
    now: DateTime<Utc>,
    outcome: &mut FoldOutcome,
) {
    let Some(id) = resolve_reference(thread, reference, next) else {
        outcome.unresolved_reference = true;
        return;
    };

    let reason = match next {
        PromiseStatus::Fulfilled => "reported fulfilled in conversation",
        _ => "called off in conversation",
    };
    if let Some(promise) = thread.promise_mut(id) {
        if promise.transition_to(next, reason, now).is_ok() {
            outcome.transitioned.push((id, next));
        } else {
            outcome.unresolved_reference = true;
        }
    }
}

fn resolve_reference(
    thread: &Thread,
    reference: &PromiseReference,
    next: PromiseStatus,
) -> Option<PromiseId> {
    let eligible = || thread.promises.iter().filter(move |promise| promise.can_transition_to(next));

    // A named promise that cannot be found stays unresolved.
    if let Some(id) = reference.id {
        return eligible().find(|promise| promise.id == id).map(|promise| promise.id);
    }
    if let Some(description) = &reference.description {
        return eligible().find(|promise| promise.describes(description)).map(|promise| promise.id);
    }

    let mut open = thread.open_promises();
    match (open.next(), open.next()) {
        (Some(only), None) => Some(only.id),
        _ => None,
    }
}
