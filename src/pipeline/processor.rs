//! Parse service: the processing side of the boundary.
//!
//! Flow per request:
//! 1. Normalize the raw blob (pure)
//! 2. Classify (never fails; degrades to keyword rules)
//! 3. Persist record, attachments, verdict, and processed flag atomically
//!
//! A success response is only built after step 3 commits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::normalizer::normalize;
use crate::pipeline::types::{NormalizedRecord, ParseRequest, ParseResponse};
use crate::store::Repository;

/// Normalize → classify → persist.
pub struct ParseService {
    classifier: Arc<dyn Classifier>,
    repo: Arc<dyn Repository>,
}

impl ParseService {
    pub fn new(classifier: Arc<dyn Classifier>, repo: Arc<dyn Repository>) -> Self {
        Self { classifier, repo }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Process one request, stamping receipt time now.
    pub async fn process(&self, request: &ParseRequest) -> Result<ParseResponse, PipelineError> {
        self.process_at(request, Utc::now()).await
    }

    /// Process one request with an explicit receipt time.
    pub async fn process_at(
        &self,
        request: &ParseRequest,
        received_at: DateTime<Utc>,
    ) -> Result<ParseResponse, PipelineError> {
        let external_id = request.external_id.as_deref().unwrap_or("-");
        info!(provider = %request.provider, external_id, "Parsing message");

        let record = normalize(request, received_at).inspect_err(|e| {
            warn!(provider = %request.provider, external_id, error = %e, "Rejecting malformed message");
        })?;

        if let Some(response) = self.already_processed(&record).await {
            info!(record_id = response.id, external_id, "Unchanged message already processed");
            return Ok(response);
        }

        let verdict = self.classifier.classify(&record).await;

        let record_id = match self.repo.ingest(&record, &verdict).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    provider = %record.provider,
                    external_id,
                    error = %e,
                    "Failed to persist message"
                );
                self.record_failure(&record, &e).await;
                return Err(e.into());
            }
        };

        info!(
            record_id,
            provider = %record.provider,
            external_id,
            classifier = self.classifier.name(),
            category = verdict.category.as_deref().unwrap_or("-"),
            "Message processed"
        );

        Ok(ParseResponse {
            id: record_id,
            from_addr: record.from_addr,
            to_addr: record.to_addr,
            subject: record.subject,
            category: verdict.category,
            sentiment: verdict.sentiment,
            summary: verdict.summary,
            processed: true,
            status: ParseResponse::SUCCESS.to_string(),
        })
    }

    /// Stored answer for a re-fetch of a message that was processed and has
    /// not changed since. Lookup errors fall through to a full pass.
    async fn already_processed(&self, record: &NormalizedRecord) -> Option<ParseResponse> {
        let external_id = record.external_id.as_deref()?;
        let existing = match self
            .repo
            .get_record_by_external_id(&record.provider, external_id)
            .await
        {
            Ok(existing) => existing?,
            Err(e) => {
                warn!(external_id, error = %e, "Could not look up existing record");
                return None;
            }
        };
        if !existing.is_processed()
            || existing.raw_headers != record.raw_headers
            || existing.raw_body != record.raw_body
            || existing.mailbox != record.mailbox
        {
            return None;
        }
        let verdict = match self.repo.latest_verdict(existing.id).await {
            Ok(verdict) => verdict?.verdict,
            Err(e) => {
                warn!(record_id = existing.id, error = %e, "Could not load stored verdict");
                return None;
            }
        };
        Some(ParseResponse {
            id: existing.id,
            from_addr: existing.from_addr,
            to_addr: existing.to_addr,
            subject: existing.subject,
            category: verdict.category,
            sentiment: verdict.sentiment,
            summary: verdict.summary,
            processed: true,
            status: ParseResponse::SUCCESS.to_string(),
        })
    }

    /// Flag an earlier copy of the record as failed, when one exists.
    /// The failed transaction itself left nothing behind.
    async fn record_failure(&self, record: &NormalizedRecord, cause: &DatabaseError) {
        let Some(external_id) = record.external_id.as_deref() else {
            return;
        };
        match self
            .repo
            .get_record_by_external_id(&record.provider, external_id)
            .await
        {
            Ok(Some(existing)) if !existing.is_processed() => {
                if let Err(e) = self.repo.mark_failed(existing.id, &cause.to_string()).await {
                    warn!(record_id = existing.id, error = %e, "Could not mark record failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(external_id, error = %e, "Could not look up failed record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::pipeline::types::ClassificationVerdict;
    use crate::pipeline::classifier::FallbackClassifier;
    use crate::pipeline::types::{ProcessingState, VerdictSource};
    use crate::store::LibSqlRepository;

    async fn service() -> (ParseService, Arc<dyn Repository>) {
        let repo: Arc<dyn Repository> = Arc::new(LibSqlRepository::new_memory().await.unwrap());
        let service = ParseService::new(Arc::new(FallbackClassifier::default()), Arc::clone(&repo));
        (service, repo)
    }

    fn request(external_id: &str, subject: &str, body: &str) -> ParseRequest {
        ParseRequest {
            raw_email: format!(
                "From: Alice <alice@example.com>\r\nTo: me@example.com\r\nSubject: {subject}\r\n\r\n{body}\r\n"
            ),
            provider: "gmail".into(),
            external_id: Some(external_id.into()),
            mailbox: "INBOX".into(),
        }
    }

    #[tokio::test]
    async fn processes_and_persists() {
        let (service, repo) = service().await;
        let response = service
            .process(&request("1", "Order shipped", "on its way"))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.category.as_deref(), Some("order"));
        assert_eq!(response.sentiment.as_deref(), Some("positive"));
        assert_eq!(response.from_addr, "Alice <alice@example.com>");

        let stored = repo.get_record(response.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ProcessingState::Processed);
        let verdict = repo.latest_verdict(response.id).await.unwrap().unwrap();
        assert_eq!(verdict.verdict.source_kind, VerdictSource::Fallback);
    }

    #[tokio::test]
    async fn same_external_id_keeps_one_record_with_latest_body() {
        let (service, repo) = service().await;
        let first = service.process(&request("msg-42", "Hi", "first")).await.unwrap();
        let second = service.process(&request("msg-42", "Hi", "second")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(repo.stats().await.unwrap().total_records, 1);
        let stored = repo.get_record(first.id).await.unwrap().unwrap();
        assert_eq!(stored.raw_body.trim(), "second");
    }

    /// Counts calls into the wrapped classifier.
    struct CountingClassifier {
        inner: FallbackClassifier,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for CountingClassifier {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn classify(&self, record: &NormalizedRecord) -> ClassificationVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.classify(record).await
        }
    }

    #[tokio::test]
    async fn unchanged_refetch_reuses_stored_verdict() {
        let repo: Arc<dyn Repository> = Arc::new(LibSqlRepository::new_memory().await.unwrap());
        let classifier = Arc::new(CountingClassifier {
            inner: FallbackClassifier::default(),
            calls: AtomicUsize::new(0),
        });
        let service = ParseService::new(Arc::clone(&classifier) as Arc<dyn Classifier>, Arc::clone(&repo));

        let req = request("55", "Invoice 2025-10", "Amount due");
        let first = service.process(&req).await.unwrap();
        let second = service.process(&req).await.unwrap();

        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert!(second.is_success());
        assert_eq!(second.category.as_deref(), Some("invoice"));
        assert_eq!(repo.list_verdicts(first.id).await.unwrap().len(), 1);

        // A changed body is classified again.
        service
            .process(&request("55", "Invoice 2025-10", "Amount due, updated"))
            .await
            .unwrap();
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(repo.list_verdicts(first.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_without_writes() {
        let (service, repo) = service().await;
        let err = service
            .process(&ParseRequest::manual("no headers here"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
        assert!(!err.is_retryable());
        assert_eq!(repo.stats().await.unwrap().total_records, 0);
    }
}
