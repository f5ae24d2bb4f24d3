//! The fetcher → parser boundary.
//!
//! The fetcher only ever talks to a `ProcessingBoundary`. In split
//! deployments that is `HttpBoundary` against the parser's REST surface;
//! when both halves run in one process it is `LocalBoundary`.

pub mod client;
pub mod routes;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoundaryError;
use crate::pipeline::processor::ParseService;
use crate::pipeline::types::{ParseRequest, ParseResponse};

pub use client::HttpBoundary;
pub use routes::{AppState, parser_routes};

/// Submit one message for processing.
///
/// `Ok` with a success status means the record is durably stored and the
/// caller may acknowledge the source message. Anything else means it may not.
#[async_trait]
pub trait ProcessingBoundary: Send + Sync {
    async fn submit(&self, request: &ParseRequest) -> Result<ParseResponse, BoundaryError>;

    /// Whether the processing side is reachable.
    async fn health(&self) -> bool;
}

/// In-process boundary that calls the parse service directly.
pub struct LocalBoundary {
    service: Arc<ParseService>,
}

impl LocalBoundary {
    pub fn new(service: Arc<ParseService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ProcessingBoundary for LocalBoundary {
    async fn submit(&self, request: &ParseRequest) -> Result<ParseResponse, BoundaryError> {
        Ok(self.service.process(request).await?)
    }

    async fn health(&self) -> bool {
        self.service.repository().stats().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::pipeline::classifier::FallbackClassifier;
    use crate::store::{LibSqlRepository, Repository};

    async fn local() -> LocalBoundary {
        let repo: Arc<dyn Repository> = Arc::new(LibSqlRepository::new_memory().await.unwrap());
        let service = ParseService::new(Arc::new(FallbackClassifier::default()), repo);
        LocalBoundary::new(Arc::new(service))
    }

    #[tokio::test]
    async fn local_submit_returns_success() {
        let boundary = local().await;
        assert!(boundary.health().await);

        let response = boundary
            .submit(&ParseRequest::manual(
                "From: a@example.com\r\nSubject: Invoice 12\r\n\r\nDue soon\r\n",
            ))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.category.as_deref(), Some("invoice"));
    }

    #[tokio::test]
    async fn local_submit_surfaces_malformed() {
        let boundary = local().await;
        let err = boundary
            .submit(&ParseRequest::manual("   "))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BoundaryError::Pipeline(PipelineError::Malformed(_))
        ));
    }
}
