//! HTTP surface for conversations, settings, sweeps and the Slack webhook.
//!
//! - `POST   /Chat`            append a message; returns the thread
//! - `GET    /Chat/{id}`       chats and promises of one thread
//! - `GET    /Settings`        current prompts and sampling parameters
//! - `PUT    /Settings`        replace them
//! - `GET    /CheckChats`      run one chat sweep
//! - `GET    /CheckDeadlines`  run one deadline scan
//! - `POST   /slack`           Events API webhook
//! - `GET    /Thread`          thread summaries
//! - `POST   /Thread`          create (or find) the thread for a participant group
//! - `GET    /Thread/{id}`     one thread
//! - `DELETE /Thread/{id}`     purge one thread

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pledge_agent::prompt::check_templates;
use pledge_agent::{
    AgentRuntime, DeadlineScanner, InboundMessage, IngestOutcome, IngestionService, ThreadKey,
};
use pledge_core::domain::chat::Chat;
use pledge_core::domain::promise::Promise;
use pledge_core::domain::settings::Settings;
use pledge_core::domain::thread::{Thread, ThreadId};
use pledge_core::errors::{ApplicationError, InterfaceError};
use pledge_db::{load_settings, save_settings, ConfigStore, ThreadRepository};
use pledge_slack::{decode_webhook, SignatureVerifier, WebhookPayload, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub threads: Arc<dyn ThreadRepository>,
    pub config_store: Arc<dyn ConfigStore>,
    pub ingestion: Arc<IngestionService>,
    pub runtime: Arc<AgentRuntime>,
    pub scanner: Arc<DeadlineScanner>,
    /// Present when a signing secret is configured; webhook requests are then
    /// rejected unless their signature checks out.
    pub verifier: Option<Arc<SignatureVerifier>>,
    pub slack_bot_user_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/Chat", post(post_chat))
        .route("/Chat/{id}", get(get_chat))
        .route("/Settings", get(get_settings).put(put_settings))
        .route("/CheckChats", get(check_chats))
        .route("/CheckDeadlines", get(check_deadlines))
        .route("/slack", post(slack_webhook))
        .route("/Thread", get(list_threads).post(create_thread))
        .route("/Thread/{id}", get(get_thread).delete(delete_thread))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError(InterfaceError);

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    detail: &'a str,
    correlation_id: &'a str,
}

impl ApiError {
    fn from_application(error: impl Into<ApplicationError>) -> Self {
        Self(error.into().into_interface(correlation_id()))
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest { message: message.into(), correlation_id: correlation_id() })
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self(InterfaceError::NotFound { message: message.into(), correlation_id: correlation_id() })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, message),
            InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, message),
            InterfaceError::ServiceUnavailable { message, .. } => (StatusCode::SERVICE_UNAVAILABLE, message),
            InterfaceError::Internal { message, .. } => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        if status.is_server_error() {
            error!(
                event_name = "server.api.error",
                correlation_id = self.0.correlation_id(),
                status = status.as_u16(),
                error = %message,
                "request failed"
            );
        } else {
            warn!(
                event_name = "server.api.rejected",
                correlation_id = self.0.correlation_id(),
                status = status.as_u16(),
                error = %message,
                "request rejected"
            );
        }

        let body = ErrorBody {
            error: self.0.user_message(),
            detail: message,
            correlation_id: self.0.correlation_id(),
        };
        (status, Json(body)).into_response()
    }
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Chats
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PostChatRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub participants: Option<Vec<String>>,
    #[serde(alias = "author")]
    pub sender: String,
    #[serde(alias = "text")]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PostChatRequest {
    fn thread_key(&self) -> Option<ThreadKey> {
        if let Some(id) = self.thread_id.as_deref().filter(|id| !id.trim().is_empty()) {
            return Some(ThreadKey::Existing(ThreadId(id.trim().to_string())));
        }
        if let Some(channel) = self.channel.as_deref().filter(|channel| !channel.trim().is_empty()) {
            return Some(ThreadKey::Channel(channel.trim().to_string()));
        }
        self.participants.clone().map(ThreadKey::Participants)
    }
}

#[derive(Debug, Serialize)]
pub struct ChatView {
    pub thread_id: ThreadId,
    pub chats: Vec<Chat>,
    pub promises: Vec<Promise>,
}

async fn post_chat(
    State(state): State<AppState>,
    Json(request): Json<PostChatRequest>,
) -> Result<Response, ApiError> {
    let key = request
        .thread_key()
        .ok_or_else(|| ApiError::bad_request("one of thread_id, channel or participants is required"))?;

    let outcome = state
        .ingestion
        .ingest(InboundMessage {
            key,
            sender: request.sender,
            text: request.message,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
            from_bot: false,
        })
        .await
        .map_err(ApiError::from_application)?;

    Ok(match outcome {
        IngestOutcome::Appended { thread, created: true } => (StatusCode::CREATED, Json(thread)).into_response(),
        IngestOutcome::Appended { thread, created: false } | IngestOutcome::Redelivered { thread } => {
            Json(thread).into_response()
        }
        IngestOutcome::IgnoredBotEcho => {
            (StatusCode::ACCEPTED, Json(json!({"status": "ignored", "reason": "bot_echo"}))).into_response()
        }
    })
}

async fn get_chat(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ChatView>, ApiError> {
    let thread = find_thread(&state, &id).await?;
    Ok(Json(ChatView { thread_id: thread.id, chats: thread.chats, promises: thread.promises }))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, ApiError> {
    let settings = load_settings(state.config_store.as_ref()).await.map_err(ApiError::from_application)?;
    Ok(Json(settings))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Result<Json<Settings>, ApiError> {
    if let Err(error) = settings.validate() {
        return Err(ApiError::bad_request(error.to_string()));
    }
    if let Err(error) = check_templates(&settings) {
        return Err(ApiError::bad_request(error.to_string()));
    }
    save_settings(state.config_store.as_ref(), &settings).await.map_err(ApiError::from_application)?;
    info!(event_name = "server.settings.updated", "settings replaced");
    Ok(Json(settings))
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

async fn check_chats(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.runtime.check_chats(Utc::now()).await {
        Ok(report) => Json(json!({"status": "completed", "report": report})),
        Err(error) => Json(json!({"status": "failed", "error": error.to_string()})),
    }
}

async fn check_deadlines(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.scanner.scan(Utc::now()).await {
        Ok(report) => Json(json!({"status": "completed", "report": report})),
        Err(error) => Json(json!({"status": "failed", "error": error.to_string()})),
    }
}

// ---------------------------------------------------------------------------
// Slack webhook
// ---------------------------------------------------------------------------

async fn slack_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(verifier) = &state.verifier {
        let timestamp = header_str(&headers, TIMESTAMP_HEADER);
        let signature = header_str(&headers, SIGNATURE_HEADER);
        if let Err(error) = verifier.verify(timestamp, signature, &body, Utc::now()) {
            warn!(event_name = "server.slack.signature_rejected", error = %error, "webhook signature rejected");
            return Ok((StatusCode::UNAUTHORIZED, Json(json!({"error": error.to_string()}))).into_response());
        }
    }

    let payload = decode_webhook(&body, state.slack_bot_user_id.as_deref())
        .map_err(|error| ApiError::bad_request(error.to_string()))?;

    match payload {
        WebhookPayload::UrlVerification { challenge } => Ok(Json(json!({"challenge": challenge})).into_response()),
        WebhookPayload::Ignored { reason } => Ok(Json(json!({"ok": true, "ignored": reason.as_str()})).into_response()),
        WebhookPayload::Message(event) => {
            let outcome = state
                .ingestion
                .ingest(InboundMessage {
                    key: ThreadKey::Channel(event.channel),
                    sender: event.sender,
                    text: event.text,
                    timestamp: event.timestamp,
                    from_bot: false,
                })
                .await
                .map_err(ApiError::from_application)?;
            let thread_id = match &outcome {
                IngestOutcome::Appended { thread, .. } | IngestOutcome::Redelivered { thread } => {
                    Some(thread.id.to_string())
                }
                IngestOutcome::IgnoredBotEcho => None,
            };
            Ok(Json(json!({"ok": true, "thread_id": thread_id, "event_id": event.event_id})).into_response())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub channel_key: String,
    pub participants: Vec<String>,
    pub chat_count: usize,
    pub open_promises: usize,
    pub responded_since_last_change: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&Thread> for ThreadSummary {
    fn from(thread: &Thread) -> Self {
        Self {
            id: thread.id.clone(),
            channel_key: thread.channel_key.clone(),
            participants: thread.participants.clone(),
            chat_count: thread.chats.len(),
            open_promises: thread.open_promises().count(),
            responded_since_last_change: thread.responded_since_last_change,
            updated_at: thread.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateThreadRequest {
    pub participants: Vec<String>,
}

async fn list_threads(State(state): State<AppState>) -> Result<Json<Vec<ThreadSummary>>, ApiError> {
    let threads = state.threads.list_all().await.map_err(ApiError::from_application)?;
    Ok(Json(threads.iter().map(ThreadSummary::from).collect()))
}

async fn create_thread(
    State(state): State<AppState>,
    Json(request): Json<CreateThreadRequest>,
) -> Result<Response, ApiError> {
    let (thread, created) = state
        .ingestion
        .create_thread(&request.participants, Utc::now())
        .await
        .map_err(ApiError::from_application)?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    let location = format!("/Thread/{}", thread.id);
    Ok((status, [(header::LOCATION, location)], Json(thread)).into_response())
}

async fn get_thread(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Thread>, ApiError> {
    Ok(Json(find_thread(&state, &id).await?))
}

async fn delete_thread(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let id = ThreadId(id);
    let removed = state.threads.delete(&id).await.map_err(ApiError::from_application)?;
    if !removed {
        return Err(ApiError::not_found(format!("thread {id}")));
    }
    info!(event_name = "server.thread.deleted", thread_id = %id, "thread purged");
    Ok(StatusCode::NO_CONTENT)
}

async fn find_thread(state: &AppState, id: &str) -> Result<Thread, ApiError> {
    let id = ThreadId(id.to_string());
    state
        .threads
        .find_by_id(&id)
        .await
        .map_err(ApiError::from_application)?
        .ok_or_else(|| ApiError::not_found(format!("thread {id}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use chrono::{Duration, Utc};
    use pledge_agent::ScriptedLlmClient;
    use pledge_core::config::AppConfig;
    use pledge_core::notify::RecordingNotificationSink;
    use pledge_db::{InMemoryConfigStore, InMemoryThreadRepository};
    use pledge_slack::SignatureVerifier;
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::router;
    use crate::bootstrap::assemble;

    struct Harness {
        app: Router,
        notifier: Arc<RecordingNotificationSink>,
    }

    fn harness(llm: ScriptedLlmClient, signing_secret: Option<&str>) -> Harness {
        let mut config = AppConfig::default();
        config.policy.time_buffer_secs = 0;
        config.slack.bot_user_id = Some("UBOT".to_string());
        config.slack.signing_secret = signing_secret.map(|secret| SecretString::from(secret.to_string()));

        let notifier = Arc::new(RecordingNotificationSink::default());
        let store = Arc::new(InMemoryConfigStore::with_blobs([
            ("initial-system-prompt.txt", "Introduce yourself."),
            ("system-prompt.txt", "Listen for promises."),
            ("promise-prompt.txt", "Follow up."),
        ]));
        let state = assemble(
            &config,
            Arc::new(InMemoryThreadRepository::default()),
            store,
            Arc::new(llm),
            notifier.clone(),
        );
        Harness { app: router(state), notifier }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri).header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json") };
        (status, value)
    }

    #[tokio::test]
    async fn chat_then_sweep_posts_the_reply() {
        let reply = r#"{"response": "Welcome! I'll keep track of promises here.", "confirmed": false}"#;
        let harness = harness(ScriptedLlmClient::replying(reply), None);
        let at = (Utc::now() - Duration::minutes(1)).to_rfc3339();

        let (status, thread) = send(
            &harness.app,
            "POST",
            "/Chat",
            Some(json!({"channel": "C1", "sender": "alice", "message": "hi team", "timestamp": at})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(thread["id"], "C1");

        let (status, sweep) = send(&harness.app, "GET", "/CheckChats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sweep["status"], "completed");
        assert_eq!(sweep["report"]["messages_posted"], 1);
        assert_eq!(harness.notifier.sent()[0].channel_key, "C1");

        let (status, chats) = send(&harness.app, "GET", "/Chat/C1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chats["chats"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn chat_without_a_thread_key_is_a_bad_request() {
        let harness = harness(ScriptedLlmClient::default(), None);

        let (status, body) =
            send(&harness.app, "POST", "/Chat", Some(json!({"sender": "alice", "message": "hi"}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn thread_create_is_idempotent_and_addressable() {
        let harness = harness(ScriptedLlmClient::default(), None);

        let (created, first) =
            send(&harness.app, "POST", "/Thread", Some(json!({"participants": ["Bob", "alice"]}))).await;
        let (again, second) =
            send(&harness.app, "POST", "/Thread", Some(json!({"participants": ["alice", "bob", "pledgebot"]}))).await;

        assert_eq!(created, StatusCode::CREATED);
        assert_eq!(again, StatusCode::OK);
        assert_eq!(first["id"], second["id"]);

        let id = first["id"].as_str().expect("id").to_string();
        let (status, listed) = send(&harness.app, "GET", "/Thread", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let (status, _) = send(&harness.app, "DELETE", &format!("/Thread/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&harness.app, "GET", &format!("/Thread/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_round_trip_and_reject_out_of_range_values() {
        let harness = harness(ScriptedLlmClient::default(), None);

        let (status, current) = send(&harness.app, "GET", "/Settings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current["system_prompt"], "Listen for promises.");

        let mut updated = current.clone();
        updated["temperature"] = json!("0.2");
        let (status, _) = send(&harness.app, "PUT", "/Settings", Some(updated)).await;
        assert_eq!(status, StatusCode::OK);

        let mut invalid = current;
        invalid["top_p"] = json!("1.5");
        let (status, _) = send(&harness.app, "PUT", "/Settings", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, stored) = send(&harness.app, "GET", "/Settings", None).await;
        assert_eq!(stored["temperature"], "0.2");
    }

    #[tokio::test]
    async fn slack_webhook_answers_challenge_and_ingests_messages() {
        let harness = harness(ScriptedLlmClient::default(), None);

        let (status, body) = send(
            &harness.app,
            "POST",
            "/slack",
            Some(json!({"type": "url_verification", "challenge": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["challenge"], "abc");

        let event = json!({"type": "event_callback", "event_id": "Ev1", "event": {
            "type": "message", "user": "U1", "text": "I'll ship it Friday", "channel": "C7", "ts": "1714554000.000100"
        }});
        let (status, body) = send(&harness.app, "POST", "/slack", Some(event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["thread_id"], "C7");

        let (status, thread) = send(&harness.app, "GET", "/Thread/C7", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(thread["chats"][0]["author"], "U1");
    }

    #[tokio::test]
    async fn slack_redelivery_after_a_reply_changes_nothing() {
        let reply = r#"{"response": "Noted, Friday it is.", "confirmed": false}"#;
        let harness = harness(ScriptedLlmClient::replying(reply), None);
        let event = json!({"type": "event_callback", "event_id": "Ev2", "event": {
            "type": "message", "user": "U1", "text": "I'll ship it Friday", "channel": "C8", "ts": "1714554000.000100"
        }});

        let (status, _) = send(&harness.app, "POST", "/slack", Some(event.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (_, sweep) = send(&harness.app, "GET", "/CheckChats", None).await;
        assert_eq!(sweep["report"]["messages_posted"], 1);

        let (status, body) = send(&harness.app, "POST", "/slack", Some(event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["thread_id"], "C8");

        let (_, thread) = send(&harness.app, "GET", "/Thread/C8", None).await;
        assert_eq!(thread["chats"].as_array().map(Vec::len), Some(2));
        assert_eq!(thread["responded_since_last_change"], true);

        let (_, sweep) = send(&harness.app, "GET", "/CheckChats", None).await;
        assert_eq!(sweep["report"]["messages_posted"], 0);
        assert_eq!(harness.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn settings_with_a_broken_template_are_refused() {
        let harness = harness(ScriptedLlmClient::default(), None);
        let (_, current) = send(&harness.app, "GET", "/Settings", None).await;

        let mut broken = current;
        broken["system_prompt"] = json!("History: {{$history}}");
        let (status, body) = send(&harness.app, "PUT", "/Settings", Some(broken)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.to_string().contains("tera"), "{body}");

        let (_, stored) = send(&harness.app, "GET", "/Settings", None).await;
        assert_eq!(stored["system_prompt"], "Listen for promises.");
    }

    #[tokio::test]
    async fn signed_webhooks_are_enforced_when_a_secret_is_set() {
        let secret = "8f742231b10e8888abcd99yyyzzz85a5";
        let harness = harness(ScriptedLlmClient::default(), Some(secret));
        let body = json!({"type": "url_verification", "challenge": "abc"}).to_string();

        let unsigned = Request::builder()
            .method("POST")
            .uri("/slack")
            .body(Body::from(body.clone()))
            .expect("request");
        let response = harness.app.clone().oneshot(unsigned).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let timestamp = Utc::now().timestamp().to_string();
        let signature = SignatureVerifier::new(SecretString::from(secret.to_string()))
            .sign(&timestamp, body.as_bytes())
            .expect("sign");
        let signed = Request::builder()
            .method("POST")
            .uri("/slack")
            .header("x-slack-request-timestamp", timestamp)
            .header("x-slack-signature", signature)
            .body(Body::from(body))
            .expect("request");
        let response = harness.app.clone().oneshot(signed).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
