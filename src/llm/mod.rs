//! Model backends for the classifier.
//!
//! rig-core does the HTTP work; `RigAdapter` narrows its `CompletionModel`
//! down to the single-shot `LlmProvider` interface the classifier needs.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use rig::providers::{anthropic, openai};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::LlmError;

/// Which hosted API the classifier calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    OpenAi,
    Anthropic,
}

impl LlmBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

/// Build a provider. No network traffic happens here; a bad key only
/// shows up on the first completion.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let key = config.api_key.expose_secret();
    let provider: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::OpenAi => {
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
        LlmBackend::Anthropic => {
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
    };

    info!(backend = config.backend.as_str(), model = %config.model, "LLM provider ready");
    Ok(provider)
}

fn client_error(backend: LlmBackend, e: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.as_str().to_string(),
        reason: format!("client setup: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: LlmBackend, model: &str) -> LlmConfig {
        LlmConfig {
            backend,
            api_key: SecretString::from("sk-test"),
            model: model.to_string(),
        }
    }

    #[test]
    fn providers_build_offline() {
        for (backend, model) in [
            (LlmBackend::OpenAi, "gpt-4o-mini"),
            (LlmBackend::Anthropic, "claude-3-5-haiku-latest"),
        ] {
            let provider = create_provider(&config(backend, model)).unwrap();
            assert_eq!(provider.model_name(), model);
        }
    }

    #[test]
    fn client_error_names_backend() {
        match client_error(LlmBackend::Anthropic, "bad url") {
            LlmError::RequestFailed { provider, reason } => {
                assert_eq!(provider, "anthropic");
                assert!(reason.contains("bad url"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
