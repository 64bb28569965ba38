//! Reminders for promises coming due, and expiry for the ones long past.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pledge_core::config::ReminderConfig;
use pledge_core::deadline::reminder_message;
use pledge_core::domain::promise::{PromiseId, PromiseStatus};
use pledge_core::notify::NotificationSink;
use pledge_db::{read_modify_upsert, Mutation, RepositoryError, ThreadRepository, DEFAULT_MAX_ATTEMPTS};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeadlineReport {
    pub threads_scanned: usize,
    pub reminders_sent: usize,
    pub reminders_failed: usize,
    pub promises_expired: usize,
    pub failed: usize,
}

struct DueReminder {
    promise_id: PromiseId,
    text: String,
}

#[derive(Default)]
struct ScanChanges {
    reminders: Vec<DueReminder>,
    expired: usize,
}

pub struct DeadlineScanner {
    threads: Arc<dyn ThreadRepository>,
    notifier: Arc<dyn NotificationSink>,
    lookahead: Duration,
    expiry_grace: Duration,
    max_attempts: u32,
}

impl DeadlineScanner {
    pub fn new(
        threads: Arc<dyn ThreadRepository>,
        notifier: Arc<dyn NotificationSink>,
        lookahead: Duration,
        expiry_grace: Duration,
    ) -> Self {
        Self { threads, notifier, lookahead, expiry_grace, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    pub fn from_config(
        threads: Arc<dyn ThreadRepository>,
        notifier: Arc<dyn NotificationSink>,
        config: &ReminderConfig,
    ) -> Self {
        Self::new(threads, notifier, config.lookahead(), config.expiry_grace())
    }

    /// `reminded_at` is committed before a reminder is posted, so a crash
    /// between the two loses a reminder rather than sending it twice.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<DeadlineReport, RepositoryError> {
        let ids = self.threads.list_ids().await?;
        let mut report = DeadlineReport { threads_scanned: ids.len(), ..DeadlineReport::default() };

        for id in ids {
            let committed = read_modify_upsert(self.threads.as_ref(), &id, self.max_attempts, |current| {
                let Some(mut thread) = current else {
                    return Mutation::Keep(None);
                };

                let mut changes = ScanChanges::default();
                for promise in thread.promises.iter_mut() {
                    if promise.needs_reminder(now, self.lookahead) {
                        promise.mark_reminded(now);
                        changes
                            .reminders
                            .push(DueReminder { promise_id: promise.id, text: reminder_message(promise) });
                    } else if promise.is_past_grace(now, self.expiry_grace)
                        && promise.transition_to(PromiseStatus::Expired, "deadline passed", now).is_ok()
                    {
                        changes.expired += 1;
                    }
                }

                if changes.reminders.is_empty() && changes.expired == 0 {
                    return Mutation::Keep(None);
                }
                let channel_key = thread.channel_key.clone();
                Mutation::Save(thread, Some((channel_key, changes)))
            })
            .await;

            let (channel_key, changes) = match committed {
                Ok(committed) => match committed.value {
                    Some(value) => value,
                    None => continue,
                },
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        event_name = "agent.deadlines.thread_failed",
                        thread_id = %id,
                        error = %error,
                        "deadline scan skipped thread"
                    );
                    continue;
                }
            };

            report.promises_expired += changes.expired;
            for reminder in changes.reminders {
                match self.notifier.post(&channel_key, &reminder.text).await {
                    Ok(()) => {
                        report.reminders_sent += 1;
                        info!(
                            event_name = "agent.deadlines.reminded",
                            thread_id = %id,
                            promise_id = %reminder.promise_id,
                            "reminder posted"
                        );
                    }
                    Err(error) => {
                        report.reminders_failed += 1;
                        warn!(
                            event_name = "agent.deadlines.reminder_failed",
                            thread_id = %id,
                            promise_id = %reminder.promise_id,
                            error = %error,
                            "reminder not delivered"
                        );
                    }
                }
            }
        }

        info!(
            event_name = "agent.deadlines.completed",
            threads_scanned = report.threads_scanned,
            reminders_sent = report.reminders_sent,
            promises_expired = report.promises_expired,
            "deadline scan finished"
        );
        Ok(report)
    }
}
