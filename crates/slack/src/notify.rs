use std::time::Duration;

use async_trait::async_trait;
use pledge_core::notify::{NotificationError, NotificationSink};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Posts messages through the Slack Web API `chat.postMessage` method.
pub struct SlackWebApiSink {
    client: reqwest::Client,
    api_base_url: String,
    bot_token: SecretString,
}

#[derive(Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackWebApiSink {
    pub fn new(api_base_url: impl Into<String>, bot_token: SecretString) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|error| NotificationError::Transport(error.to_string()))?;
        Ok(Self { client, api_base_url: api_base_url.into(), bot_token })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat.postMessage", self.api_base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl NotificationSink for SlackWebApiSink {
    async fn post(&self, channel_key: &str, text: &str) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.bot_token.expose_secret())
            .json(&PostMessage { channel: channel_key, text })
            .send()
            .await
            .map_err(|error| NotificationError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Transport(format!("slack returned HTTP {status}")));
        }

        let body: PostMessageResponse = response
            .json()
            .await
            .map_err(|error| NotificationError::Transport(error.to_string()))?;
        if !body.ok {
            return Err(NotificationError::Rejected(
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        Ok(())
    }
}

/// Stand-in used when no bot token is configured: messages are only logged.
#[derive(Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn post(&self, channel_key: &str, text: &str) -> Result<(), NotificationError> {
        info!(
            event_name = "slack.notify.logged",
            channel_key,
            text_len = text.len(),
            "no slack bot token configured; message not delivered"
        );
        Ok(())
    }
}

/// Builds the sink the configuration asks for.
pub fn sink_from_config(
    config: &pledge_core::config::SlackConfig,
) -> Result<Box<dyn NotificationSink>, NotificationError> {
    match &config.bot_token {
        Some(token) => Ok(Box::new(SlackWebApiSink::new(&config.api_base_url, token.clone())?)),
        None => {
            warn!(
                event_name = "slack.notify.disabled",
                "slack.bot_token is not set; outbound messages will only be logged"
            );
            Ok(Box::new(LoggingNotificationSink))
        }
    }
}
