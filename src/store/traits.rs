//! `Repository` trait: the single async interface for persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::{
    AttachmentMeta, ClassificationVerdict, IngestStats, NormalizedRecord, ProcessingState,
};

/// A persisted message record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub external_id: Option<String>,
    pub provider: String,
    pub from_addr: String,
    pub to_addr: String,
    pub cc_addr: Option<String>,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub raw_headers: String,
    pub raw_body: String,
    pub mailbox: String,
    pub state: ProcessingState,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn is_processed(&self) -> bool {
        self.state == ProcessingState::Processed
    }
}

/// A persisted verdict row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredVerdict {
    pub id: i64,
    pub record_id: i64,
    #[serde(flatten)]
    pub verdict: ClassificationVerdict,
    pub created_at: DateTime<Utc>,
}

/// A persisted attachment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAttachment {
    pub id: i64,
    pub record_id: i64,
    #[serde(flatten)]
    pub meta: AttachmentMeta,
}

/// A record with its authoritative (latest) verdict, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: StoredRecord,
    pub analysis: Option<StoredVerdict>,
}

/// Listing filters. Unset fields do not filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub limit: u32,
    pub offset: u32,
    /// Matches the latest verdict's category.
    pub category: Option<String>,
    /// Matches the latest verdict's sentiment.
    pub sentiment: Option<String>,
    pub processed: Option<bool>,
    /// Case-insensitive substring of subject, sender, or body.
    pub search: Option<String>,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            category: None,
            sentiment: None,
            processed: None,
            search: None,
        }
    }
}

/// Backend-agnostic persistence for records, attachments, and verdicts.
///
/// The individual write steps are exposed for callers that need them, but
/// the pipeline only uses `ingest`, which runs all of them atomically.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Writes ──────────────────────────────────────────────────────

    /// Insert or update by `(provider, external_id)`. Records without an
    /// external id are always inserted. Resets the record to pending.
    async fn upsert_record(&self, record: &NormalizedRecord) -> Result<i64, DatabaseError>;

    /// Replace the record's attachment rows.
    async fn store_attachments(
        &self,
        record_id: i64,
        attachments: &[AttachmentMeta],
    ) -> Result<(), DatabaseError>;

    /// Append a verdict row. Returns the verdict id.
    async fn attach_classification(
        &self,
        record_id: i64,
        verdict: &ClassificationVerdict,
    ) -> Result<i64, DatabaseError>;

    /// pending → processed.
    async fn mark_processed(&self, record_id: i64) -> Result<(), DatabaseError>;

    /// pending → failed(reason).
    async fn mark_failed(&self, record_id: i64, reason: &str) -> Result<(), DatabaseError>;

    /// Upsert, attachments, verdict, and processed flag as one transaction.
    /// Any failure leaves the store as it was.
    async fn ingest(
        &self,
        record: &NormalizedRecord,
        verdict: &ClassificationVerdict,
    ) -> Result<i64, DatabaseError>;

    /// Delete a record; attachments and verdicts cascade.
    async fn delete_record(&self, record_id: i64) -> Result<bool, DatabaseError>;

    // ── Reads ───────────────────────────────────────────────────────

    async fn get_record(&self, record_id: i64) -> Result<Option<StoredRecord>, DatabaseError>;

    async fn get_record_by_external_id(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<StoredRecord>, DatabaseError>;

    /// Newest records first, each with its latest verdict.
    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<RecordView>, DatabaseError>;

    /// Number of records matching `filter`, ignoring limit and offset.
    async fn count_records(&self, filter: &RecordFilter) -> Result<u64, DatabaseError>;

    /// The authoritative verdict for a record.
    async fn latest_verdict(&self, record_id: i64) -> Result<Option<StoredVerdict>, DatabaseError>;

    /// Full verdict history, oldest first.
    async fn list_verdicts(&self, record_id: i64) -> Result<Vec<StoredVerdict>, DatabaseError>;

    async fn list_attachments(
        &self,
        record_id: i64,
    ) -> Result<Vec<StoredAttachment>, DatabaseError>;

    /// Total, classified, and processed record counts.
    async fn stats(&self) -> Result<IngestStats, DatabaseError>;
}
