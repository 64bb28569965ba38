use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::domain::promise::Promise;
use crate::errors::DomainError;

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S %z",
    "%Y-%m-%d %H:%M %z",
    "%m/%d/%Y %I:%M:%S %p %z",
    "%m/%d/%Y %I:%M %p %z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Resolves an extracted deadline to an absolute instant.
///
/// Text carrying an offset is taken as-is. Naive date-times are read in
/// `default_offset`, and a bare date means the end of that day.
pub fn parse_deadline(text: &str, default_offset: FixedOffset) -> Result<DateTime<Utc>, DomainError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(DomainError::UnparsableDeadline(text.to_string()));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }

    for format in ZONED_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Ok(parsed.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return in_offset(naive, default_offset, text);
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            let end_of_day = NaiveTime::from_hms_opt(23, 59, 59)
                .ok_or_else(|| DomainError::UnparsableDeadline(text.to_string()))?;
            return in_offset(date.and_time(end_of_day), default_offset, text);
        }
    }

    Err(DomainError::UnparsableDeadline(text.to_string()))
}

fn in_offset(
    naive: NaiveDateTime,
    offset: FixedOffset,
    text: &str,
) -> Result<DateTime<Utc>, DomainError> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| DomainError::UnparsableDeadline(text.to_string()))
}

pub fn reminder_message(promise: &Promise) -> String {
    format!(
        "Just a reminder that a promise is due soon! The promise is _{}_. {}, let us know when it's been fulfilled, or if we need to reschedule or cancel it.",
        promise.description, promise.promisor
    )
}

pub fn clarification_message(deadline_text: &str) -> String {
    if deadline_text.trim().is_empty() {
        "I couldn't tell when that's due. Could you give a specific date and time?".to_string()
    } else {
        format!(
            "I couldn't pin down \"{}\" as a deadline. Could you give a specific date and time?",
            deadline_text.trim()
        )
    }
}
