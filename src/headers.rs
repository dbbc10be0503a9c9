//! Per-record retry state carried in headers.
//!
//! Headers are the only persisted retry state. Every republish writes the
//! full set; a record on a retry stage without its origin headers is a
//! protocol violation.

use crate::bus::{ConsumedRecord, Headers};
use crate::failure::ListenerFailure;

pub const ORIGINAL_TOPIC: &str = "detour-original-topic";
pub const ORIGINAL_PARTITION: &str = "detour-original-partition";
pub const ORIGINAL_OFFSET: &str = "detour-original-offset";
pub const ATTEMPTS: &str = "detour-attempts";
pub const FIRST_ATTEMPT_TIMESTAMP: &str = "detour-first-attempt-timestamp";
pub const DUE_AT: &str = "detour-due-at";
pub const EXCEPTION_KIND: &str = "detour-exception-kind";
pub const EXCEPTION_CAUSE_KINDS: &str = "detour-exception-cause-kinds";
pub const EXCEPTION_MESSAGE: &str = "detour-exception-message";

/// Header protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("Missing retry header '{0}'")]
    Missing(&'static str),

    #[error("Invalid value for retry header '{name}': {value}")]
    Invalid { name: &'static str, value: String },
}

/// Retry state of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    /// Attempts completed before this delivery.
    pub attempts: u32,
    pub first_attempt_ms: i64,
    /// When this hop may be processed.
    pub due_at_ms: Option<i64>,
    pub exception_kind: Option<String>,
    /// Kinds of the latest failure's whole chain, outermost first.
    pub cause_kinds: Vec<String>,
    pub exception_message: Option<String>,
}

impl RetryState {
    /// State for a record seen for the first time on its main topic.
    pub fn first_attempt(record: &ConsumedRecord, now_ms: i64) -> Self {
        Self {
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            attempts: 0,
            first_attempt_ms: now_ms,
            due_at_ms: None,
            exception_kind: None,
            cause_kinds: Vec::new(),
            exception_message: None,
        }
    }

    /// Read the state, or `None` if the record carries no retry headers.
    ///
    /// Origin headers are required once any retry header is present.
    pub fn from_headers(headers: &Headers) -> Result<Option<Self>, HeaderError> {
        let present = [ORIGINAL_TOPIC, ORIGINAL_OFFSET, ATTEMPTS]
            .iter()
            .any(|name| headers.get(name).is_some());
        if !present {
            return Ok(None);
        }

        let original_topic = required_str(headers, ORIGINAL_TOPIC)?.to_string();
        let original_offset = required(headers, ORIGINAL_OFFSET)?;
        let original_partition = required(headers, ORIGINAL_PARTITION)?;
        let attempts = required(headers, ATTEMPTS)?;
        let first_attempt_ms = required(headers, FIRST_ATTEMPT_TIMESTAMP)?;
        let due_at_ms = optional(headers, DUE_AT)?;

        let cause_kinds = headers
            .get_str(EXCEPTION_CAUSE_KINDS)
            .map(|v| {
                v.split(',')
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(Self {
            original_topic,
            original_partition,
            original_offset,
            attempts,
            first_attempt_ms,
            due_at_ms,
            exception_kind: headers.get_str(EXCEPTION_KIND).map(String::from),
            cause_kinds,
            exception_message: headers.get_str(EXCEPTION_MESSAGE).map(String::from),
        }))
    }

    /// State for the next hop after `failure`, due at `due_at_ms`.
    ///
    /// Origin fields are carried unchanged; the attempt count grows by one.
    pub fn next_hop(&self, failure: &ListenerFailure, due_at_ms: i64) -> Self {
        Self {
            original_topic: self.original_topic.clone(),
            original_partition: self.original_partition,
            original_offset: self.original_offset,
            attempts: self.attempts.saturating_add(1),
            first_attempt_ms: self.first_attempt_ms,
            due_at_ms: Some(due_at_ms),
            exception_kind: Some(failure.kind().to_string()),
            cause_kinds: failure.chain_kinds().into_iter().map(String::from).collect(),
            exception_message: Some(failure.message().to_string()),
        }
    }

    /// Write every field, replacing earlier values.
    pub fn apply(&self, headers: &mut Headers) {
        headers.insert(ORIGINAL_TOPIC, self.original_topic.as_bytes());
        headers.insert(ORIGINAL_PARTITION, self.original_partition.to_string());
        headers.insert(ORIGINAL_OFFSET, self.original_offset.to_string());
        headers.insert(ATTEMPTS, self.attempts.to_string());
        headers.insert(FIRST_ATTEMPT_TIMESTAMP, self.first_attempt_ms.to_string());
        match self.due_at_ms {
            Some(due) => headers.insert(DUE_AT, due.to_string()),
            None => headers.remove(DUE_AT),
        }
        if let Some(kind) = &self.exception_kind {
            headers.insert(EXCEPTION_KIND, kind.as_bytes());
        }
        if !self.cause_kinds.is_empty() {
            headers.insert(EXCEPTION_CAUSE_KINDS, self.cause_kinds.join(","));
        }
        if let Some(message) = &self.exception_message {
            headers.insert(EXCEPTION_MESSAGE, message.as_bytes());
        }
    }
}

fn required_str<'a>(headers: &'a Headers, name: &'static str) -> Result<&'a str, HeaderError> {
    match headers.get(name) {
        None => Err(HeaderError::Missing(name)),
        Some(raw) => std::str::from_utf8(raw).map_err(|_| HeaderError::Invalid {
            name,
            value: String::from_utf8_lossy(raw).into_owned(),
        }),
    }
}

fn required<T: std::str::FromStr>(headers: &Headers, name: &'static str) -> Result<T, HeaderError> {
    optional(headers, name)?.ok_or(HeaderError::Missing(name))
}

fn optional<T: std::str::FromStr>(
    headers: &Headers,
    name: &'static str,
) -> Result<Option<T>, HeaderError> {
    if headers.get(name).is_none() {
        return Ok(None);
    }
    let raw = required_str(headers, name)?;
    raw.trim().parse().map(Some).map_err(|_| HeaderError::Invalid {
        name,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConsumedRecord {
        ConsumedRecord {
            topic: "orders".to_string(),
            partition: 2,
            offset: 41,
            key: None,
            payload: None,
            headers: Headers::new(),
            timestamp_ms: None,
        }
    }

    #[test]
    fn test_no_headers_is_none() {
        assert_eq!(RetryState::from_headers(&Headers::new()), Ok(None));
    }

    #[test]
    fn test_hops_preserve_origin_and_count_attempts() {
        let first = RetryState::first_attempt(&record(), 1_000);
        let failure = ListenerFailure::new("Timeout", "slow")
            .caused_by(ListenerFailure::new("Io", "reset"));

        let mut headers = Headers::new();
        first.next_hop(&failure, 2_000).apply(&mut headers);
        let hop1 = RetryState::from_headers(&headers).unwrap().unwrap();

        hop1.next_hop(&failure, 3_000).apply(&mut headers);
        let hop2 = RetryState::from_headers(&headers).unwrap().unwrap();

        for hop in [&hop1, &hop2] {
            assert_eq!(hop.original_topic, "orders");
            assert_eq!(hop.original_partition, 2);
            assert_eq!(hop.original_offset, 41);
            assert_eq!(hop.first_attempt_ms, 1_000);
        }
        assert_eq!(hop1.attempts, 1);
        assert_eq!(hop2.attempts, 2);
        assert_eq!(hop2.due_at_ms, Some(3_000));
        assert_eq!(hop2.exception_kind.as_deref(), Some("Timeout"));
        assert_eq!(hop2.cause_kinds, vec!["Timeout", "Io"]);
        assert_eq!(hop2.exception_message.as_deref(), Some("slow"));
    }

    #[test]
    fn test_apply_replaces_previous_values() {
        let mut headers = Headers::new();
        headers.push(ATTEMPTS, "7");
        let state = RetryState::first_attempt(&record(), 0).next_hop(&ListenerFailure::new("X", ""), 5);
        state.apply(&mut headers);

        assert_eq!(headers.iter().filter(|(k, _)| *k == ATTEMPTS).count(), 1);
        assert_eq!(headers.get_str(ATTEMPTS), Some("1"));
    }

    #[test]
    fn test_missing_origin_is_reported() {
        let mut headers = Headers::new();
        headers.insert(ATTEMPTS, "1");
        assert_eq!(
            RetryState::from_headers(&headers),
            Err(HeaderError::Missing(ORIGINAL_TOPIC))
        );

        headers.insert(ORIGINAL_TOPIC, "orders");
        assert_eq!(
            RetryState::from_headers(&headers),
            Err(HeaderError::Missing(ORIGINAL_OFFSET))
        );
    }

    #[test]
    fn test_malformed_value_is_reported() {
        let mut headers = Headers::new();
        RetryState::first_attempt(&record(), 0)
            .next_hop(&ListenerFailure::new("X", ""), 5)
            .apply(&mut headers);
        headers.insert(ATTEMPTS, "many");

        assert!(matches!(
            RetryState::from_headers(&headers),
            Err(HeaderError::Invalid { name: ATTEMPTS, .. })
        ));
    }
}
