//! End-to-end ingestion tests: scripted mailbox → orchestrator → local
//! boundary → parse service → libSQL.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use mail_ingest::boundary::LocalBoundary;
use mail_ingest::channels::MessageSource;
use mail_ingest::error::DatabaseError;
use mail_ingest::pipeline::classifier::FallbackClassifier;
use mail_ingest::pipeline::orchestrator::IngestionOrchestrator;
use mail_ingest::pipeline::processor::ParseService;
use mail_ingest::pipeline::types::{
    AttachmentMeta, ClassificationVerdict, IngestStats, NormalizedRecord, RawMessage,
};
use mail_ingest::store::{
    LibSqlRepository, RecordFilter, RecordView, Repository, StoredAttachment, StoredRecord,
    StoredVerdict,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Scripted mailbox ─────────────────────────────────────────────────

/// In-memory mailbox. Unread messages stay until acknowledged.
#[derive(Default)]
struct Mailbox {
    unread: BTreeMap<String, String>,
    acks: Vec<String>,
}

#[derive(Clone, Default)]
struct ScriptedSource {
    mailbox: Arc<Mutex<Mailbox>>,
}

impl ScriptedSource {
    fn deliver(&self, uid: &str, blob: &str) {
        self.mailbox
            .lock()
            .unwrap()
            .unread
            .insert(uid.to_string(), blob.to_string());
    }

    fn acks(&self) -> Vec<String> {
        self.mailbox.lock().unwrap().acks.clone()
    }

    fn unread_count(&self) -> usize {
        self.mailbox.lock().unwrap().unread.len()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&mut self) -> bool {
        true
    }

    async fn fetch_unread(&mut self, _lookback: Duration) -> Vec<RawMessage> {
        self.mailbox
            .lock()
            .unwrap()
            .unread
            .iter()
            .map(|(uid, blob)| RawMessage::from_blob(uid, "imap", "INBOX", blob))
            .collect()
    }

    async fn acknowledge(&mut self, source_id: &str) -> bool {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.unread.remove(source_id);
        mailbox.acks.push(source_id.to_string());
        true
    }

    async fn disconnect(&mut self) {}
}

// ── Repository with an outage switch ─────────────────────────────────

struct FlakyRepository {
    inner: LibSqlRepository,
    down: AtomicBool,
}

impl FlakyRepository {
    fn check(&self) -> Result<(), DatabaseError> {
        if self.down.load(Ordering::SeqCst) {
            Err(DatabaseError::Query("database is locked".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }
    async fn upsert_record(&self, record: &NormalizedRecord) -> Result<i64, DatabaseError> {
        self.check()?;
        self.inner.upsert_record(record).await
    }
    async fn store_attachments(
        &self,
        record_id: i64,
        attachments: &[AttachmentMeta],
    ) -> Result<(), DatabaseError> {
        self.check()?;
        self.inner.store_attachments(record_id, attachments).await
    }
    async fn attach_classification(
        &self,
        record_id: i64,
        verdict: &ClassificationVerdict,
    ) -> Result<i64, DatabaseError> {
        self.check()?;
        self.inner.attach_classification(record_id, verdict).await
    }
    async fn mark_processed(&self, record_id: i64) -> Result<(), DatabaseError> {
        self.check()?;
        self.inner.mark_processed(record_id).await
    }
    async fn mark_failed(&self, record_id: i64, reason: &str) -> Result<(), DatabaseError> {
        self.check()?;
        self.inner.mark_failed(record_id, reason).await
    }
    async fn ingest(
        &self,
        record: &NormalizedRecord,
        verdict: &ClassificationVerdict,
    ) -> Result<i64, DatabaseError> {
        self.check()?;
        self.inner.ingest(record, verdict).await
    }
    async fn delete_record(&self, record_id: i64) -> Result<bool, DatabaseError> {
        self.inner.delete_record(record_id).await
    }
    async fn get_record(&self, record_id: i64) -> Result<Option<StoredRecord>, DatabaseError> {
        self.inner.get_record(record_id).await
    }
    async fn get_record_by_external_id(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<StoredRecord>, DatabaseError> {
        self.inner.get_record_by_external_id(provider, external_id).await
    }
    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<RecordView>, DatabaseError> {
        self.inner.list_records(filter).await
    }
    async fn count_records(&self, filter: &RecordFilter) -> Result<u64, DatabaseError> {
        self.inner.count_records(filter).await
    }
    async fn latest_verdict(&self, record_id: i64) -> Result<Option<StoredVerdict>, DatabaseError> {
        self.inner.latest_verdict(record_id).await
    }
    async fn list_verdicts(&self, record_id: i64) -> Result<Vec<StoredVerdict>, DatabaseError> {
        self.inner.list_verdicts(record_id).await
    }
    async fn list_attachments(
        &self,
        record_id: i64,
    ) -> Result<Vec<StoredAttachment>, DatabaseError> {
        self.inner.list_attachments(record_id).await
    }
    async fn stats(&self) -> Result<IngestStats, DatabaseError> {
        self.inner.stats().await
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    source: ScriptedSource,
    repo: Arc<FlakyRepository>,
    orchestrator: IngestionOrchestrator,
}

async fn harness() -> Harness {
    let repo = Arc::new(FlakyRepository {
        inner: LibSqlRepository::new_memory().await.unwrap(),
        down: AtomicBool::new(false),
    });
    let service = ParseService::new(
        Arc::new(FallbackClassifier::default()),
        Arc::clone(&repo) as Arc<dyn Repository>,
    );
    let source = ScriptedSource::default();
    let orchestrator = IngestionOrchestrator::new(
        Box::new(source.clone()),
        Arc::new(LocalBoundary::new(Arc::new(service))),
        Duration::from_secs(86_400),
    );
    Harness {
        source,
        repo,
        orchestrator,
    }
}

fn blob(subject: &str, body: &str) -> String {
    format!(
        "From: Dana <dana@example.com>\r\nTo: me@example.com\r\nSubject: {subject}\r\nDate: Mon, 13 Oct 2025 08:00:00 +0000\r\n\r\n{body}\r\n"
    )
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn encoded_subject_is_processed_and_acknowledged_once() {
    timeout(TEST_TIMEOUT, async {
        let mut h = harness().await;
        h.source.deliver(
            "501",
            &blob("=?UTF-8?B?Q2Fmw6kgcmVuZGV6LXZvdXM=?=", "À demain"),
        );

        let report = h.orchestrator.run_cycle().await;
        assert_eq!(report.fetched, 1);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(h.source.acks(), vec!["501".to_string()]);

        let stats = h.repo.stats().await.unwrap();
        assert_eq!(stats.total_records, 1);
        assert_eq!(stats.processed_records, 1);

        let record = h
            .repo
            .get_record_by_external_id("imap", "501")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.subject, "Café rendez-vous");
        let verdict = h.repo.latest_verdict(record.id).await.unwrap().unwrap();
        assert_eq!(verdict.verdict.category.as_deref(), Some("general"));

        // Nothing left unread, so a second cycle acknowledges nothing new.
        let report = h.orchestrator.run_cycle().await;
        assert_eq!(report.fetched, 0);
        assert_eq!(h.source.acks().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn redelivered_uid_updates_the_same_record() {
    timeout(TEST_TIMEOUT, async {
        let mut h = harness().await;
        h.source.deliver("msg-42", &blob("Status", "first body"));
        h.orchestrator.run_cycle().await;

        h.source.deliver("msg-42", &blob("Status", "second body"));
        h.orchestrator.run_cycle().await;

        assert_eq!(h.repo.stats().await.unwrap().total_records, 1);
        let record = h
            .repo
            .get_record_by_external_id("imap", "msg-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.raw_body.trim(), "second body");
        assert!(record.is_processed());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn outage_leaves_message_unread_until_retry_succeeds() {
    timeout(TEST_TIMEOUT, async {
        let mut h = harness().await;
        h.source.deliver("900", &blob("Invoice 2025-10", "Amount due"));
        h.source.deliver("901", &blob("Lunch", "Noon?"));

        h.repo.down.store(true, Ordering::SeqCst);
        let report = h.orchestrator.run_cycle().await;
        assert_eq!(report.fetched, 2);
        assert_eq!(report.acknowledged, 0);
        assert_eq!(report.failed, 2);
        assert!(h.source.acks().is_empty());
        assert_eq!(h.source.unread_count(), 2);
        assert_eq!(h.repo.stats().await.unwrap().total_records, 0);

        h.repo.down.store(false, Ordering::SeqCst);
        let report = h.orchestrator.run_cycle().await;
        assert_eq!(report.acknowledged, 2);
        assert_eq!(h.source.unread_count(), 0);

        let stats = h.repo.stats().await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.processed_records, 2);

        let invoice = h
            .repo
            .get_record_by_external_id("imap", "900")
            .await
            .unwrap()
            .unwrap();
        let verdict = h.repo.latest_verdict(invoice.id).await.unwrap().unwrap();
        assert_eq!(verdict.verdict.category.as_deref(), Some("invoice"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_message_is_not_acknowledged() {
    timeout(TEST_TIMEOUT, async {
        let mut h = harness().await;
        h.source.deliver("777", "this is not a message at all");
        h.source.deliver("778", &blob("Hello", "fine"));

        let report = h.orchestrator.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.source.acks(), vec!["778".to_string()]);
        assert_eq!(h.repo.stats().await.unwrap().total_records, 1);
    })
    .await
    .expect("test timed out");
}
