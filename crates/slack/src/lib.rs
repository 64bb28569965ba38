//! Slack integration for pledge
//!
//! - **Events** (`events`) - Events API webhook bodies decoded into a tagged union
//! - **Signatures** (`signature`) - `X-Slack-Signature` verification for inbound requests
//! - **Notifications** (`notify`) - `chat.postMessage` delivery for replies and reminders
//!
//! # Flow
//!
//! ```text
//! POST /slack → SignatureVerifier → decode_webhook → IngestionService
//!                                                        ↓
//!           chat.postMessage ← SlackWebApiSink ← sweeps / reminders
//! ```

pub mod events;
pub mod notify;
pub mod signature;

pub use events::{decode_webhook, IgnoreReason, MessageEvent, PayloadError, WebhookPayload};
pub use notify::{sink_from_config, LoggingNotificationSink, SlackWebApiSink};
pub use signature::{SignatureError, SignatureVerifier, SIGNATURE_HEADER, TIMESTAMP_HEADER};
