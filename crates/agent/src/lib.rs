//! Agent runtime for pledge: turns conversations into tracked promises.
//!
//! The agent follows a constrained loop per thread:
//! 1. **Policy** - ask [`pledge_core::policy::ResponsePolicy`] whether the
//!    thread is due for a response.
//! 2. **Completion** (`llm`, `prompt`) - send the history and the selected
//!    prompt to the configured model.
//! 3. **Fold** (`extraction`) - parse the structured reply and apply it to the
//!    latest stored thread with a version-checked upsert.
//! 4. **Delivery** (`runtime`) - post the bot reply to the thread's channel.
//!
//! `deadlines` runs on its own schedule and reminds promisors before their
//! promises fall due. `ingest` is the write path for inbound messages.
//!
//! The model only proposes. Whether a promise is created, which transitions
//! are legal and when reminders fire are decided by `pledge-core`.

pub mod deadlines;
pub mod extraction;
pub mod ingest;
pub mod llm;
pub mod prompt;
pub mod runtime;

pub use deadlines::{DeadlineReport, DeadlineScanner};
pub use extraction::{EngineError, EngineSettings, ExtractionReport, PromiseExtractionEngine};
pub use ingest::{InboundMessage, IngestError, IngestOutcome, IngestionService, ThreadKey};
pub use llm::{CompletionRequest, HttpLlmClient, LlmClient, LlmError, RetryPolicy, ScriptedLlmClient};
pub use runtime::{AgentRuntime, SweepReport};
