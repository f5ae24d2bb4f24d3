//! Shared types for the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Raw message ─────────────────────────────────────────────────────

/// A message as pulled from the mailbox, before any parsing.
///
/// Owned by the `MessageSource` until it is handed to the processing
/// boundary; never retained afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Mailbox-local identifier (IMAP UID).
    pub source_id: String,
    /// Provider tag: "gmail", "outlook", "imap", "manual".
    pub provider: String,
    /// Mailbox/folder the message came from.
    pub mailbox: String,
    /// Header block, without the separating blank line.
    pub raw_headers: String,
    /// Everything after the header block.
    pub raw_body: String,
}

impl RawMessage {
    /// Split a full RFC 5322 blob into header and body blocks.
    pub fn from_blob(source_id: &str, provider: &str, mailbox: &str, blob: &str) -> Self {
        let (raw_headers, raw_body) = split_header_block(blob);
        Self {
            source_id: source_id.to_string(),
            provider: provider.to_string(),
            mailbox: mailbox.to_string(),
            raw_headers: raw_headers.to_string(),
            raw_body: raw_body.to_string(),
        }
    }

    /// Reassemble the blob sent over the boundary.
    pub fn to_blob(&self) -> String {
        format!("{}\n\n{}", self.raw_headers, self.raw_body)
    }

    /// Build the boundary request. The source id doubles as the dedup key.
    pub fn to_parse_request(&self) -> ParseRequest {
        ParseRequest {
            raw_email: self.to_blob(),
            provider: self.provider.clone(),
            external_id: Some(self.source_id.clone()),
            mailbox: self.mailbox.clone(),
        }
    }
}

/// Split at the first blank line (CRLF or LF). No blank line → all headers.
pub fn split_header_block(blob: &str) -> (&str, &str) {
    let crlf = blob.find("\r\n\r\n").map(|pos| (pos, pos + 4));
    let lf = blob.find("\n\n").map(|pos| (pos, pos + 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((end, start)) => (&blob[..end], &blob[start..]),
        None => (blob, ""),
    }
}

// ── Boundary wire types ─────────────────────────────────────────────

fn default_provider() -> String {
    "manual".to_string()
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

/// Request crossing the fetcher → parser boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseRequest {
    pub raw_email: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Absent for ad hoc submissions; every such submission is a new row.
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

impl ParseRequest {
    /// An ad hoc submission with no dedup key.
    pub fn manual(raw_email: impl Into<String>) -> Self {
        Self {
            raw_email: raw_email.into(),
            provider: default_provider(),
            external_id: None,
            mailbox: default_mailbox(),
        }
    }
}

/// Successful response from the processing boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResponse {
    pub id: i64,
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub processed: bool,
    pub status: String,
}

impl ParseResponse {
    pub const SUCCESS: &'static str = "success";

    /// Only a processed, successful response allows acknowledgement.
    pub fn is_success(&self) -> bool {
        self.processed && self.status == Self::SUCCESS
    }
}

/// Aggregate counts for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    #[serde(rename = "total_emails")]
    pub total_records: u64,
    #[serde(rename = "analyzed_emails")]
    pub classified_records: u64,
    #[serde(rename = "processed_emails")]
    pub processed_records: u64,
}

// ── Normalized record ───────────────────────────────────────────────

/// Attachment metadata; content is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    /// Length of the encoded (transfer-encoded) payload.
    pub size_bytes: u64,
}

/// Canonical message record produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Dedup key, unique per provider. `None` for ad hoc submissions.
    pub external_id: Option<String>,
    pub provider: String,
    pub from_addr: String,
    pub to_addr: String,
    pub cc_addr: Option<String>,
    pub subject: String,
    /// From the `Date` header, or receipt time when unparsable.
    pub sent_at: DateTime<Utc>,
    pub raw_headers: String,
    /// Extracted text body.
    pub raw_body: String,
    pub mailbox: String,
    pub attachments: Vec<AttachmentMeta>,
}

// ── Classification ──────────────────────────────────────────────────

/// Which classifier produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Model,
    Fallback,
}

impl VerdictSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for VerdictSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::Model),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown verdict source '{other}'")),
        }
    }
}

/// Classification of one record by one classifier attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    pub category: Option<String>,
    pub sentiment: Option<String>,
    pub summary: Option<String>,
    /// Always within [0, 1].
    pub confidence_score: f32,
    pub source_kind: VerdictSource,
}

// ── Processing state ────────────────────────────────────────────────

/// Per-record processing state, derived from the processed/error columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Processed,
    Failed(String),
}

impl ProcessingState {
    pub fn from_columns(processed: bool, error: Option<String>) -> Self {
        match (processed, error) {
            (true, _) => Self::Processed,
            (false, Some(reason)) => Self::Failed(reason),
            (false, None) => Self::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_lf_blank_line() {
        let (headers, body) = split_header_block("Subject: hi\nFrom: a@x.com\n\nbody\n\nmore");
        assert_eq!(headers, "Subject: hi\nFrom: a@x.com");
        assert_eq!(body, "body\n\nmore");
    }

    #[test]
    fn split_on_crlf_blank_line() {
        let (headers, body) = split_header_block("Subject: hi\r\n\r\nbody");
        assert_eq!(headers, "Subject: hi");
        assert_eq!(body, "body");
    }

    #[test]
    fn split_without_body() {
        let (headers, body) = split_header_block("Subject: only headers");
        assert_eq!(headers, "Subject: only headers");
        assert_eq!(body, "");
    }

    #[test]
    fn raw_message_parse_request_uses_source_id() {
        let raw = RawMessage::from_blob("42", "gmail", "INBOX", "Subject: x\r\n\r\nhello");
        let request = raw.to_parse_request();
        assert_eq!(request.external_id.as_deref(), Some("42"));
        assert_eq!(request.provider, "gmail");
        assert_eq!(request.raw_email, "Subject: x\n\nhello");
    }

    #[test]
    fn parse_request_defaults_for_manual_submissions() {
        let request: ParseRequest =
            serde_json::from_str(r#"{"raw_email": "Subject: x\n\nbody"}"#).unwrap();
        assert_eq!(request.provider, "manual");
        assert_eq!(request.mailbox, "INBOX");
        assert!(request.external_id.is_none());
    }

    #[test]
    fn response_success_requires_processed_flag() {
        let mut response = ParseResponse {
            id: 1,
            from_addr: "a@x.com".into(),
            to_addr: "b@x.com".into(),
            subject: "hi".into(),
            category: None,
            sentiment: None,
            summary: None,
            processed: true,
            status: "success".into(),
        };
        assert!(response.is_success());
        response.processed = false;
        assert!(!response.is_success());
    }

    #[test]
    fn stats_serialize_with_wire_field_names() {
        let stats = IngestStats {
            total_records: 3,
            classified_records: 2,
            processed_records: 1,
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["total_emails"], 3);
        assert_eq!(json["analyzed_emails"], 2);
        assert_eq!(json["processed_emails"], 1);
    }

    #[test]
    fn processing_state_from_columns() {
        assert_eq!(ProcessingState::from_columns(true, None), ProcessingState::Processed);
        assert_eq!(
            ProcessingState::from_columns(false, Some("disk full".into())),
            ProcessingState::Failed("disk full".into())
        );
        assert_eq!(ProcessingState::from_columns(false, None), ProcessingState::Pending);
    }
}
