//! Builds the completion request for one extraction cycle.

use std::error::Error as _;

use chrono::{DateTime, SecondsFormat, Utc};
use pledge_core::domain::promise::Promise;
use pledge_core::domain::settings::{PromptKind, Settings};
use pledge_core::domain::thread::{Thread, ThreadId};
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

use crate::llm::CompletionRequest;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error(
        "{kind} prompt template failed to render: {message}; prompts are tera templates \
         (`{{{{ bot_name }}}}`) and may use participants, bot_name, now and promise_count"
    )]
    Template { kind: &'static str, message: String },
    #[error("conversation context could not be serialized: {0}")]
    Context(String),
}

pub fn select_prompt_kind(thread: &Thread) -> PromptKind {
    if thread.open_promises().next().is_some() {
        PromptKind::PromiseCheck
    } else if !thread.has_bot_chat() {
        PromptKind::Initial
    } else {
        PromptKind::SteadyState
    }
}

/// Renders the stored prompt as a tera template. Prompts without template
/// syntax come back unchanged.
pub fn render_system_prompt(
    template: &str,
    kind: PromptKind,
    thread: &Thread,
    bot_name: &str,
    now: DateTime<Utc>,
) -> Result<String, PromptError> {
    let mut context = Context::new();
    context.insert("participants", &participant_names(thread));
    context.insert("bot_name", bot_name);
    context.insert("now", &now.to_rfc3339_opts(SecondsFormat::Secs, true));
    context.insert("promise_count", &thread.open_promises().count());

    Tera::one_off(template, &context, false)
        .map_err(|error| PromptError::Template { kind: kind.as_str(), message: describe(&error) })
}

/// Renders every stored prompt against an empty thread so a broken template
/// is refused when it is saved instead of on the next extraction.
pub fn check_templates(settings: &Settings) -> Result<(), PromptError> {
    let now = Utc::now();
    let sample = Thread::new(ThreadId("settings-check".to_string()), "settings-check", now);
    for kind in [PromptKind::Initial, PromptKind::SteadyState, PromptKind::PromiseCheck] {
        render_system_prompt(settings.prompt(kind), kind, &sample, "bot", now)?;
    }
    Ok(())
}

// tera's top-level message only names the template; the cause sits further down.
fn describe(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Serialize)]
struct ConversationContext<'a> {
    now: String,
    bot_name: &'a str,
    participants: Vec<String>,
    history: Vec<HistoryEntry<'a>>,
    promises: Vec<PromiseEntry<'a>>,
}

#[derive(Serialize)]
struct HistoryEntry<'a> {
    author: &'a str,
    message: &'a str,
    timestamp: String,
    from_bot: bool,
}

#[derive(Serialize)]
struct PromiseEntry<'a> {
    id: String,
    description: &'a str,
    promisor: &'a str,
    promise_holder: &'a str,
    deadline: String,
    deadline_text: &'a str,
    status: &'static str,
}

impl<'a> From<&'a Promise> for PromiseEntry<'a> {
    fn from(promise: &'a Promise) -> Self {
        Self {
            id: promise.id.to_string(),
            description: &promise.description,
            promisor: &promise.promisor,
            promise_holder: &promise.promise_holder,
            deadline: promise.deadline.to_rfc3339_opts(SecondsFormat::Secs, true),
            deadline_text: &promise.deadline_text,
            status: promise.status.as_str(),
        }
    }
}

/// Full chat history, the non-bot participants and every promise, as the JSON
/// document sent for the user turn.
pub fn build_context_json(thread: &Thread, bot_name: &str, now: DateTime<Utc>) -> Result<String, PromptError> {
    let context = ConversationContext {
        now: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        bot_name,
        participants: participant_names(thread),
        history: thread
            .chats
            .iter()
            .map(|chat| HistoryEntry {
                author: &chat.author,
                message: &chat.message,
                timestamp: chat.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                from_bot: chat.is_from_bot(),
            })
            .collect(),
        promises: thread.promises.iter().map(PromiseEntry::from).collect(),
    };

    serde_json::to_string(&context).map_err(|error| PromptError::Context(error.to_string()))
}

pub fn build_request(
    thread: &Thread,
    settings: &Settings,
    bot_name: &str,
    now: DateTime<Utc>,
    max_tokens: u32,
) -> Result<(PromptKind, CompletionRequest), PromptError> {
    let kind = select_prompt_kind(thread);
    let system_prompt = render_system_prompt(settings.prompt(kind), kind, thread, bot_name, now)?;
    let context_json = build_context_json(thread, bot_name, now)?;

    Ok((
        kind,
        CompletionRequest {
            system_prompt,
            context_json,
            top_p: settings.top_p,
            temperature: settings.temperature,
            max_tokens,
        },
    ))
}

/// Registered participants when the thread has them, otherwise whoever has
/// spoken.
fn participant_names(thread: &Thread) -> Vec<String> {
    if thread.participants.is_empty() {
        thread.human_authors()
    } else {
        thread.participants.clone()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use pledge_core::domain::chat::Chat;
    use pledge_core::domain::promise::{Promise, PromiseDraft};
    use pledge_core::domain::settings::{PromptKind, Settings};
    use pledge_core::domain::thread::{Thread, ThreadId};
    use rust_decimal::Decimal;

    use super::{
        build_context_json, build_request, check_templates, render_system_prompt, select_prompt_kind, PromptError,
    };

    fn settings() -> Settings {
        Settings {
            initial_prompt: "Introduce yourself as {{ bot_name }} to {{ participants | join(sep=\", \") }}."
                .to_string(),
            system_prompt: "Listen for promises.".to_string(),
            promise_prompt: "{{ promise_count }} promise(s) are open.".to_string(),
            top_p: Decimal::ONE,
            temperature: Decimal::new(7, 1),
        }
    }

    fn thread() -> Thread {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().expect("timestamp");
        let mut thread = Thread::new(ThreadId("C1".to_string()), "C1", t0);
        thread.participants = vec!["alice".to_string(), "bob".to_string()];
        thread.append_chat(Chat::human("alice", "Bob, can you send the report tomorrow?", t0));
        thread
    }

    #[test]
    fn prompt_kind_follows_thread_state() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().expect("timestamp");
        let mut thread = thread();
        assert_eq!(select_prompt_kind(&thread), PromptKind::Initial);

        thread.append_chat(Chat::bot("pledgebot", "Hi all!", t0 + Duration::minutes(1)));
        assert_eq!(select_prompt_kind(&thread), PromptKind::SteadyState);

        let draft = PromiseDraft {
            description: "send the report".to_string(),
            promisor: "bob".to_string(),
            promise_holder: "alice".to_string(),
            deadline_text: "2024-05-02T09:00:00Z".to_string(),
        };
        thread.promises.push(Promise::confirmed(draft, t0 + Duration::days(1), t0));
        assert_eq!(select_prompt_kind(&thread), PromptKind::PromiseCheck);
    }

    #[test]
    fn templates_see_participants_and_bot_name() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 5, 0).single().expect("timestamp");
        let (kind, request) = build_request(&thread(), &settings(), "pledgebot", now, 500).expect("request");

        assert_eq!(kind, PromptKind::Initial);
        assert_eq!(request.system_prompt, "Introduce yourself as pledgebot to alice, bob.");
        assert_eq!(request.max_tokens, 500);
        assert_eq!(request.temperature, Decimal::new(7, 1));
    }

    #[test]
    fn plain_prompts_render_verbatim_and_broken_ones_fail() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 5, 0).single().expect("timestamp");

        assert_eq!(
            render_system_prompt("Listen for promises.", PromptKind::SteadyState, &thread(), "bot", now)
                .expect("render"),
            "Listen for promises."
        );
        assert!(render_system_prompt("{{ unclosed", PromptKind::SteadyState, &thread(), "bot", now).is_err());
    }

    #[test]
    fn context_json_carries_history_and_promises() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 5, 0).single().expect("timestamp");
        let json = build_context_json(&thread(), "pledgebot", now).expect("context");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

        assert_eq!(value["participants"], serde_json::json!(["alice", "bob"]));
        assert_eq!(value["history"][0]["author"], "alice");
        assert_eq!(value["history"][0]["from_bot"], false);
        assert_eq!(value["promises"], serde_json::json!([]));
        assert_eq!(value["now"], "2024-05-01T09:05:00Z");
    }

    #[test]
    fn settings_check_refuses_foreign_placeholder_syntax() {
        assert!(check_templates(&settings()).is_ok());

        let mut broken = settings();
        broken.system_prompt = "Conversation so far: {{$history}}".to_string();
        let error = check_templates(&broken).expect_err("`$` is not tera syntax");

        assert!(matches!(error, PromptError::Template { kind: "steady_state", .. }));
        let message = error.to_string();
        assert!(message.contains("{{ bot_name }}"), "{message}");
        assert!(message.contains("promise_count"), "{message}");
    }

    #[test]
    fn settings_check_refuses_unknown_variables() {
        let mut broken = settings();
        broken.promise_prompt = "Open: {{ open_promises }}".to_string();

        assert!(matches!(
            check_templates(&broken),
            Err(PromptError::Template { kind: "promise_check", .. })
        ));
    }
}
