//! HTTP client side of the boundary, for split deployments.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::ProcessingBoundary;
use crate::error::BoundaryError;
use crate::pipeline::types::{ParseRequest, ParseResponse};

/// Talks to a parser service's `/parse` and `/health` endpoints.
pub struct HttpBoundary {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBoundary {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BoundaryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BoundaryError::Unreachable(format!("client setup: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport_error(&self, e: reqwest::Error) -> BoundaryError {
        if e.is_timeout() {
            BoundaryError::Timeout(self.timeout)
        } else {
            BoundaryError::Unreachable(e.to_string())
        }
    }
}

/// Pull `detail` (or `error`) out of an error body, else use it raw.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("detail")
                .or_else(|| v.get("error"))
                .and_then(|d| d.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl ProcessingBoundary for HttpBoundary {
    async fn submit(&self, request: &ParseRequest) -> Result<ParseResponse, BoundaryError> {
        let url = format!("{}/parse", self.base_url);
        debug!(%url, external_id = request.external_id.as_deref().unwrap_or("-"), "Submitting message");

        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BoundaryError::Rejected {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        let response: ParseResponse = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                BoundaryError::Timeout(self.timeout)
            } else {
                BoundaryError::InvalidResponse(e.to_string())
            }
        })?;

        if !response.is_success() {
            return Err(BoundaryError::InvalidResponse(format!(
                "status '{}'",
                response.status
            )));
        }
        Ok(response)
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("ok").and_then(|ok| ok.as_bool()))
                .unwrap_or(false),
            Ok(resp) => {
                warn!(status = %resp.status(), "Parser health check failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "Parser unreachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let b = HttpBoundary::new("http://parser:8000/", Duration::from_secs(5)).unwrap();
        assert_eq!(b.base_url(), "http://parser:8000");
    }

    #[test]
    fn error_detail_prefers_json_field() {
        assert_eq!(
            error_detail(r#"{"status":"error","detail":"Malformed input: empty"}"#),
            "Malformed input: empty"
        );
        assert_eq!(error_detail(r#"{"error":"nope"}"#), "nope");
        assert_eq!(error_detail("Bad Gateway\n"), "Bad Gateway");
    }

    #[tokio::test]
    async fn unreachable_parser_is_not_healthy() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let b = HttpBoundary::new(&format!("http://127.0.0.1:{port}"), Duration::from_millis(500))
            .unwrap();
        assert!(!b.health().await);
        let err = b.submit(&ParseRequest::manual("Subject: x\r\n\r\ny")).await.unwrap_err();
        assert!(matches!(
            err,
            BoundaryError::Unreachable(_) | BoundaryError::Timeout(_)
        ));
    }
}
