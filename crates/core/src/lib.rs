pub mod config;
pub mod deadline;
pub mod domain;
pub mod errors;
pub mod extraction;
pub mod notify;
pub mod policy;

pub use domain::chat::{Chat, ChatId};
pub use domain::promise::{Promise, PromiseDraft, PromiseId, PromiseStatus, PromiseTransition};
pub use domain::settings::{PromptKind, SettingKey, Settings, SettingsBlobs};
pub use domain::thread::{ChatAppend, Thread, ThreadId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use extraction::{
    fold_extraction, parse_extraction, ExtractionError, ExtractionIntent, ExtractionResult,
    FoldContext, FoldOutcome,
};
pub use notify::{NotificationError, NotificationSink, RecordingNotificationSink};
pub use policy::{ResponseDecision, ResponsePolicy};
