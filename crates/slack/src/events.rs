use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// A webhook body, decoded once at the boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookPayload {
    UrlVerification { challenge: String },
    Message(MessageEvent),
    Ignored { reason: IgnoreReason },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub channel: String,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub event_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    UnsupportedEnvelope,
    UnsupportedEvent(String),
    BotMessage,
    Subtype(String),
    MissingSender,
    EmptyText,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedEnvelope => "unsupported_envelope",
            Self::UnsupportedEvent(_) => "unsupported_event",
            Self::BotMessage => "bot_message",
            Self::Subtype(_) => "subtype",
            Self::MissingSender => "missing_sender",
            Self::EmptyText => "empty_text",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("webhook body is not valid JSON: {0}")]
    Malformed(String),
    #[error("message event is missing `{0}`")]
    MissingField(&'static str),
    #[error("message timestamp `{0}` is not a Slack ts")]
    InvalidTimestamp(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawEnvelope {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: RawEvent,
        #[serde(default)]
        event_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// Decodes an Events API body. Messages authored by bots (including this bot,
/// identified by `bot_user_id`) and edit/delete subtypes come back as
/// [`WebhookPayload::Ignored`].
pub fn decode_webhook(body: &[u8], bot_user_id: Option<&str>) -> Result<WebhookPayload, PayloadError> {
    let envelope: RawEnvelope =
        serde_json::from_slice(body).map_err(|error| PayloadError::Malformed(error.to_string()))?;

    let (event, event_id) = match envelope {
        RawEnvelope::UrlVerification { challenge } => {
            return Ok(WebhookPayload::UrlVerification { challenge })
        }
        RawEnvelope::EventCallback { event, event_id } => (event, event_id),
        RawEnvelope::Other => {
            return Ok(WebhookPayload::Ignored { reason: IgnoreReason::UnsupportedEnvelope })
        }
    };

    if event.kind != "message" {
        return Ok(WebhookPayload::Ignored { reason: IgnoreReason::UnsupportedEvent(event.kind) });
    }

    if event.bot_id.is_some() || event.subtype.as_deref() == Some("bot_message") {
        return Ok(WebhookPayload::Ignored { reason: IgnoreReason::BotMessage });
    }

    if let Some(subtype) = event.subtype {
        return Ok(WebhookPayload::Ignored { reason: IgnoreReason::Subtype(subtype) });
    }

    let Some(sender) = event.user.filter(|user| !user.trim().is_empty()) else {
        return Ok(WebhookPayload::Ignored { reason: IgnoreReason::MissingSender });
    };

    if bot_user_id.is_some_and(|bot| bot.eq_ignore_ascii_case(sender.trim())) {
        return Ok(WebhookPayload::Ignored { reason: IgnoreReason::BotMessage });
    }

    let text = event.text.unwrap_or_default();
    if text.trim().is_empty() {
        return Ok(WebhookPayload::Ignored { reason: IgnoreReason::EmptyText });
    }

    let channel = event
        .channel
        .filter(|channel| !channel.trim().is_empty())
        .ok_or(PayloadError::MissingField("channel"))?;
    let ts = event.ts.ok_or(PayloadError::MissingField("ts"))?;
    let timestamp = parse_slack_ts(&ts).ok_or(PayloadError::InvalidTimestamp(ts))?;

    Ok(WebhookPayload::Message(MessageEvent { channel, sender, text, timestamp, event_id }))
}

/// Slack `ts` values are unix seconds with a six-digit fractional part.
pub fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (seconds, fraction) = match ts.trim().split_once('.') {
        Some((seconds, fraction)) => (seconds, fraction),
        None => (ts.trim(), ""),
    };

    let seconds: i64 = seconds.parse().ok()?;
    let micros: u32 = if fraction.is_empty() {
        0
    } else {
        if fraction.len() > 6 || !fraction.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        format!("{fraction:0<6}").parse().ok()?
    };

    DateTime::from_timestamp(seconds, micros * 1_000)
}
