//! REST surface of the parser service.
//!
//! `/parse`, `/health`, and `/stats` are the fetcher-facing boundary. The
//! `/api/*` routes serve the read-only inbox UI.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::PipelineError;
use crate::pipeline::processor::ParseService;
use crate::pipeline::types::{ParseRequest, ProcessingState};
use crate::store::{RecordFilter, Repository, StoredAttachment, StoredRecord, StoredVerdict};

const MAX_PAGE_SIZE: u32 = 200;

/// Shared state for parser routes.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ParseService>,
    pub repo: Arc<dyn Repository>,
}

impl AppState {
    pub fn new(service: Arc<ParseService>) -> Self {
        let repo = Arc::clone(service.repository());
        Self { service, repo }
    }
}

/// Build the parser router.
pub fn parser_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/parse", post(parse))
        .route("/api/parse", post(parse))
        .route("/stats", get(stats))
        .route("/api/stats", get(stats))
        .route("/api/emails", get(list_emails))
        .route("/api/emails/{id}", get(get_email))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, detail: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({"status": "error", "detail": detail.to_string()})),
    )
        .into_response()
}

// ── Boundary ────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": "mail-ingest",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// POST /parse
///
/// 200 only once the record is committed. 422 for unreadable input,
/// 500 when persistence fails.
async fn parse(State(state): State<AppState>, Json(request): Json<ParseRequest>) -> Response {
    match state.service.process(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(e @ PipelineError::Malformed(_)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e)
        }
        Err(e @ PipelineError::Persistence(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.repo.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error = %e, "Stats query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

// ── Inbox API ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    limit: Option<u32>,
    offset: Option<u32>,
    category: Option<String>,
    sentiment: Option<String>,
    processed: Option<bool>,
    search: Option<String>,
}

impl ListParams {
    fn into_filter(self) -> RecordFilter {
        let defaults = RecordFilter::default();
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        RecordFilter {
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE_SIZE),
            offset: self.offset.unwrap_or(0),
            category: non_empty(self.category),
            sentiment: non_empty(self.sentiment),
            processed: self.processed,
            search: non_empty(self.search),
        }
    }
}

/// GET /api/emails
async fn list_emails(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    let filter = params.into_filter();
    let (views, total) = match tokio::try_join!(
        state.repo.list_records(&filter),
        state.repo.count_records(&filter)
    ) {
        Ok(found) => found,
        Err(e) => {
            error!(error = %e, "Listing records failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };

    let data: Vec<serde_json::Value> = views
        .iter()
        .map(|v| email_json(&v.record, v.analysis.as_ref(), None))
        .collect();

    Json(serde_json::json!({
        "data": data,
        "total": total,
        "page": filter.offset / filter.limit + 1,
        "limit": filter.limit,
        "hasMore": u64::from(filter.offset) + u64::from(filter.limit) < total,
    }))
    .into_response()
}

/// GET /api/emails/{id}
async fn get_email(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let record = match state.repo.get_record(id).await {
        Ok(Some(r)) => r,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("Email {id} not found")),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let found = tokio::try_join!(
        state.repo.latest_verdict(id),
        state.repo.list_attachments(id)
    );
    match found {
        Ok((analysis, attachments)) => {
            Json(email_json(&record, analysis.as_ref(), Some(&attachments))).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Inbox UI shape for a record.
fn email_json(
    record: &StoredRecord,
    analysis: Option<&StoredVerdict>,
    attachments: Option<&[StoredAttachment]>,
) -> serde_json::Value {
    let error = match &record.state {
        ProcessingState::Failed(reason) => Some(reason.as_str()),
        _ => None,
    };
    let mut json = serde_json::json!({
        "id": record.id,
        "provider": record.provider,
        "external_id": record.external_id,
        "from_addr": record.from_addr,
        "to_addr": record.to_addr,
        "cc_addr": record.cc_addr,
        "subject": record.subject,
        "sent_at": record.sent_at.to_rfc3339(),
        "received_at": record.created_at.to_rfc3339(),
        "raw_headers": record.raw_headers,
        "raw_body": record.raw_body,
        "mailbox": record.mailbox,
        "processed": record.is_processed(),
        "processed_at": record.processed_at.map(|t| t.to_rfc3339()),
        "error": error,
        "analysis": analysis.map(|a| serde_json::json!({
            "id": a.id,
            "email_id": a.record_id,
            "summary": a.verdict.summary,
            "category": a.verdict.category,
            "sentiment": a.verdict.sentiment,
            "score": a.verdict.confidence_score,
            "source_kind": a.verdict.source_kind.as_str(),
            "created_at": a.created_at.to_rfc3339(),
        })),
    });
    if let Some(attachments) = attachments {
        json["attachments"] = attachments
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "email_id": a.record_id,
                    "filename": a.meta.filename,
                    "mime_type": a.meta.mime_type,
                    "size_bytes": a.meta.size_bytes,
                })
            })
            .collect();
    }
    json
}
