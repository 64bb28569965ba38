use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification rejected by provider: {0}")]
    Rejected(String),
}

/// Outbound delivery of bot messages and reminders to a thread's channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post(&self, channel_key: &str, text: &str) -> Result<(), NotificationError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentNotification {
    pub channel_key: String,
    pub text: String,
}

/// Keeps every posted message in memory. Useful wherever delivery has to be
/// observed rather than performed.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<SentNotification>>,
    fail_with: Option<NotificationError>,
}

impl RecordingNotificationSink {
    pub fn failing(error: NotificationError) -> Self {
        Self { sent: Mutex::new(Vec::new()), fail_with: Some(error) }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn post(&self, channel_key: &str, text: &str) -> Result<(), NotificationError> {
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }

        let mut sent = self
            .sent
            .lock()
            .map_err(|_| NotificationError::Transport("recording sink lock poisoned".to_string()))?;
        sent.push(SentNotification { channel_key: channel_key.to_string(), text: text.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{NotificationError, NotificationSink, RecordingNotificationSink};

    #[tokio::test]
    async fn recording_sink_keeps_messages_in_order() {
        let sink = RecordingNotificationSink::default();
        sink.post("C1", "first").await.expect("post");
        sink.post("C2", "second").await.expect("post");

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].channel_key, "C2");
    }

    #[tokio::test]
    async fn failing_sink_reports_the_configured_error() {
        let sink =
            RecordingNotificationSink::failing(NotificationError::Rejected("channel_not_found".into()));

        let error = sink.post("C1", "hello").await.expect_err("should fail");
        assert_eq!(error, NotificationError::Rejected("channel_not_found".into()));
        assert!(sink.sent().is_empty());
    }
}
