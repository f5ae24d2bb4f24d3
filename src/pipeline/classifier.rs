//! Message classification.
//!
//! Two variants behind the `Classifier` trait, chosen once at startup:
//! - `ModelClassifier` asks an LLM for a JSON verdict and degrades to the
//!   keyword rules on any backend error, timeout, or unparsable reply.
//! - `FallbackClassifier` applies the keyword rules directly.
//!
//! Classification never fails; the worst case is a fallback verdict.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;
use crate::error::LlmError;
use crate::llm::{create_provider, ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::rules::KeywordRules;
use crate::pipeline::types::{ClassificationVerdict, NormalizedRecord, VerdictSource};

/// Confidence attached to every keyword-rule verdict.
pub const FALLBACK_CONFIDENCE: f32 = 0.7;

const CLASSIFY_MAX_TOKENS: u32 = 300;

const CLASSIFY_TEMPERATURE: f32 = 0.3;

/// Body characters sent to the model.
const BODY_PREVIEW_CHARS: usize = 2000;

/// Produces a verdict for a normalized record.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Classify a record. Must return within a bounded time.
    async fn classify(&self, record: &NormalizedRecord) -> ClassificationVerdict;
}

// ── Fallback ────────────────────────────────────────────────────────

/// Deterministic keyword classifier.
pub struct FallbackClassifier {
    rules: KeywordRules,
}

impl FallbackClassifier {
    pub fn new(rules: KeywordRules) -> Self {
        Self { rules }
    }

    /// Synchronous verdict, also used by `ModelClassifier` when degrading.
    pub fn verdict(&self, record: &NormalizedRecord) -> ClassificationVerdict {
        let matched = self.rules.evaluate(&record.subject);
        let from = if record.from_addr.is_empty() {
            "unknown"
        } else {
            record.from_addr.as_str()
        };
        ClassificationVerdict {
            category: Some(matched.category),
            sentiment: Some(matched.sentiment),
            summary: Some(format!("{from} regarding: {}", record.subject)),
            confidence_score: FALLBACK_CONFIDENCE,
            source_kind: VerdictSource::Fallback,
        }
    }
}

impl Default for FallbackClassifier {
    fn default() -> Self {
        Self::new(KeywordRules::default_rules())
    }
}

#[async_trait]
impl Classifier for FallbackClassifier {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn classify(&self, record: &NormalizedRecord) -> ClassificationVerdict {
        self.verdict(record)
    }
}

// ── Model ───────────────────────────────────────────────────────────

/// LLM-backed classifier with a bounded call time.
pub struct ModelClassifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    fallback: FallbackClassifier,
}

impl ModelClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self {
            llm,
            timeout,
            fallback: FallbackClassifier::default(),
        }
    }

    async fn ask_model(&self, record: &NormalizedRecord) -> Result<ClassificationVerdict, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt()),
            ChatMessage::user(build_classify_user_prompt(record)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let provider = self.llm.model_name();
        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: provider.to_string(),
                timeout: self.timeout,
            })??;

        parse_classify_response(&response.content, provider).inspect_err(|e| {
            debug!(raw_response = %response.content, error = %e, "Unparsable classifier reply");
        })
    }
}

#[async_trait]
impl Classifier for ModelClassifier {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn classify(&self, record: &NormalizedRecord) -> ClassificationVerdict {
        match self.ask_model(record).await {
            Ok(verdict) => {
                debug!(
                    external_id = record.external_id.as_deref().unwrap_or("-"),
                    category = verdict.category.as_deref().unwrap_or("-"),
                    model = self.llm.model_name(),
                    "Model verdict"
                );
                verdict
            }
            Err(e) => {
                warn!(
                    external_id = record.external_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Model classification failed, using keyword rules"
                );
                self.fallback.verdict(record)
            }
        }
    }
}

/// Pick the classifier variant once, from configuration.
pub fn build_classifier(config: &ClassifierConfig) -> Arc<dyn Classifier> {
    let Some(llm_config) = config.llm.as_ref() else {
        info!("No LLM key configured, classifying with keyword rules");
        return Arc::new(FallbackClassifier::default());
    };

    match create_provider(llm_config) {
        Ok(llm) => {
            info!(model = llm.model_name(), "Classifying with model");
            Arc::new(ModelClassifier::new(llm, config.timeout))
        }
        Err(e) => {
            warn!(error = %e, "LLM provider unavailable, classifying with keyword rules");
            Arc::new(FallbackClassifier::default())
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_system_prompt() -> String {
    "You classify incoming emails.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"category\": \"...\", \"sentiment\": \"...\", \"summary\": \"...\", \"confidence\": 0.0}\n\n\
     Rules:\n\
     - category: one short lowercase word (e.g. \"invoice\", \"order\", \"support\", \"sales\", \"general\")\n\
     - sentiment: one of \"positive\", \"negative\", \"neutral\"\n\
     - summary: 1-2 sentences\n\
     - confidence: number between 0 and 1"
        .to_string()
}

fn build_classify_user_prompt(record: &NormalizedRecord) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("From: {}\n", record.from_addr));
    prompt.push_str(&format!("To: {}\n", record.to_addr));
    prompt.push_str(&format!("Subject: {}\n", record.subject));

    let body_preview: String = record.raw_body.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nBody:\n{}", body_preview));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    sentiment: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "score")]
    confidence: Option<f32>,
}

fn parse_classify_response(raw: &str, provider: &str) -> Result<ClassificationVerdict, LlmError> {
    let response: ClassifyResponse = serde_json::from_str(&extract_json_object(raw))?;

    let confidence = response
        .confidence
        .filter(|c| c.is_finite())
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "missing confidence".to_string(),
        })?;

    Ok(ClassificationVerdict {
        category: response
            .category
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty()),
        sentiment: response.sentiment.as_deref().and_then(normalize_sentiment),
        summary: response
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        confidence_score: confidence.clamp(0.0, 1.0),
        source_kind: VerdictSource::Model,
    })
}

/// Map model sentiment labels (English or French) onto the fixed set.
fn normalize_sentiment(raw: &str) -> Option<String> {
    let label = match raw.trim().to_lowercase().as_str() {
        "positive" | "positif" => "positive",
        "negative" | "negatif" | "négatif" => "negative",
        "neutral" | "neutre" => "neutral",
        _ => return None,
    };
    Some(label.to_string())
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
