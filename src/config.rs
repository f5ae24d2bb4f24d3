//! Configuration types, built once at startup from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Parser server and mailbox fetcher in one process.
    All,
    /// Only the HTTP processing boundary.
    Parser,
    /// Only the mailbox fetcher, talking to a remote parser.
    Fetcher,
}

impl RunMode {
    pub fn runs_parser(self) -> bool {
        matches!(self, Self::All | Self::Parser)
    }

    pub fn runs_fetcher(self) -> bool {
        matches!(self, Self::All | Self::Fetcher)
    }
}

impl std::str::FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "parser" => Ok(Self::Parser),
            "fetcher" => Ok(Self::Fetcher),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_INGEST_MODE".into(),
                message: format!("expected all|parser|fetcher, got '{other}'"),
            }),
        }
    }
}

/// Mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Provider tag stored with every record ("gmail", "outlook", "imap").
    pub provider: String,
    pub mailbox: String,
    /// How far back to search for unread messages.
    pub lookback: Duration,
    /// When false, acknowledge is a no-op and messages stay unread.
    pub mark_as_seen: bool,
    /// Connect/read/write timeout for the IMAP socket.
    pub timeout: Duration,
}

/// Fetcher-side settings: cadence and where to send messages.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub poll_interval: Duration,
    pub parser_url: String,
    pub boundary_timeout: Duration,
}

/// Parser-side settings.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
}

/// Classifier settings. `llm` is `None` when no backend key is present.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub llm: Option<LlmConfig>,
    pub timeout: Duration,
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub mode: RunMode,
    /// Present whenever the fetcher runs.
    pub mailbox: Option<MailboxConfig>,
    pub fetcher: FetcherConfig,
    pub parser: ParserConfig,
    pub classifier: ClassifierConfig,
    pub log_dir: Option<PathBuf>,
}

impl IngestConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mode: RunMode = match non_empty("MAIL_INGEST_MODE") {
            Some(m) => m.parse()?,
            None => RunMode::All,
        };

        let mailbox = if mode.runs_fetcher() {
            Some(mailbox_from_vars(&non_empty)?)
        } else {
            None
        };

        let fetcher = FetcherConfig {
            poll_interval: Duration::from_secs(positive_or(&non_empty, "POLL_INTERVAL_SECONDS", 300)?),
            parser_url: non_empty("MAIL_PARSER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8000".to_string()),
            boundary_timeout: Duration::from_secs(parse_or(&non_empty, "BOUNDARY_TIMEOUT_SECS", 30)?),
        };

        let parser = ParserConfig {
            bind_addr: non_empty("MAIL_INGEST_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            db_path: non_empty("MAIL_INGEST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/mail-ingest.db")),
        };

        let llm = if let Some(key) = non_empty("OPENAI_API_KEY") {
            Some(LlmConfig {
                backend: LlmBackend::OpenAi,
                api_key: SecretString::from(key),
                model: non_empty("CLASSIFIER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            })
        } else {
            non_empty("ANTHROPIC_API_KEY").map(|key| LlmConfig {
                backend: LlmBackend::Anthropic,
                api_key: SecretString::from(key),
                model: non_empty("CLASSIFIER_MODEL")
                    .unwrap_or_else(|| "claude-3-5-haiku-latest".to_string()),
            })
        };

        let classifier = ClassifierConfig {
            llm,
            timeout: Duration::from_secs(parse_or(&non_empty, "CLASSIFIER_TIMEOUT_SECS", 20)?),
        };

        Ok(Self {
            mode,
            mailbox,
            fetcher,
            parser,
            classifier,
            log_dir: non_empty("MAIL_INGEST_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn mailbox_from_vars<F>(non_empty: &F) -> Result<MailboxConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let username = non_empty("EMAIL_USER").ok_or_else(|| ConfigError::MissingRequired {
        key: "EMAIL_USER".into(),
        hint: "Set EMAIL_USER and EMAIL_PASSWORD, or run with MAIL_INGEST_MODE=parser".into(),
    })?;
    let password = non_empty("EMAIL_PASSWORD").ok_or_else(|| ConfigError::MissingRequired {
        key: "EMAIL_PASSWORD".into(),
        hint: "Use an app password for Gmail/Outlook accounts".into(),
    })?;

    let lookback_days: u64 = parse_or(non_empty, "FETCH_SINCE_DAYS", 3)?;

    Ok(MailboxConfig {
        imap_host: non_empty("IMAP_HOST").unwrap_or_else(|| "imap.gmail.com".to_string()),
        imap_port: parse_or(non_empty, "IMAP_PORT", 993)?,
        username,
        password: SecretString::from(password),
        provider: non_empty("EMAIL_PROVIDER").unwrap_or_else(|| "gmail".to_string()),
        mailbox: non_empty("MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
        lookback: Duration::from_secs(lookback_days * 24 * 3600),
        mark_as_seen: non_empty("MARK_AS_SEEN")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(true),
        timeout: Duration::from_secs(parse_or(non_empty, "IMAP_TIMEOUT_SECS", 30)?),
    })
}

/// Parse a variable, falling back to `default` when unset.
fn parse_or<F, T>(non_empty: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Like `parse_or`, but zero is rejected.
fn positive_or<F>(non_empty: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_or(non_empty, key, default)? {
        0 => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        }),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn fetcher_requires_credentials() {
        let err = IngestConfig::from_vars(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "EMAIL_USER"));

        let err = IngestConfig::from_vars(lookup(&[("EMAIL_USER", "me@x.com")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "EMAIL_PASSWORD"));
    }

    #[test]
    fn parser_mode_needs_no_mailbox() {
        let config = IngestConfig::from_vars(lookup(&[("MAIL_INGEST_MODE", "parser")])).unwrap();
        assert_eq!(config.mode, RunMode::Parser);
        assert!(config.mailbox.is_none());
        assert!(config.classifier.llm.is_none());
    }

    #[test]
    fn mailbox_defaults_apply() {
        let config = IngestConfig::from_vars(lookup(&[
            ("EMAIL_USER", "me@x.com"),
            ("EMAIL_PASSWORD", "secret"),
        ]))
        .unwrap();

        let mailbox = config.mailbox.unwrap();
        assert_eq!(mailbox.imap_host, "imap.gmail.com");
        assert_eq!(mailbox.imap_port, 993);
        assert_eq!(mailbox.mailbox, "INBOX");
        assert_eq!(mailbox.provider, "gmail");
        assert_eq!(mailbox.lookback, Duration::from_secs(3 * 24 * 3600));
        assert!(mailbox.mark_as_seen);
        assert_eq!(mailbox.password.expose_secret(), "secret");
        assert_eq!(config.fetcher.poll_interval, Duration::from_secs(300));
        assert_eq!(config.mode, RunMode::All);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = IngestConfig::from_vars(lookup(&[
            ("MAIL_INGEST_MODE", "parser"),
            ("POLL_INTERVAL_SECONDS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "POLL_INTERVAL_SECONDS"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = IngestConfig::from_vars(lookup(&[
            ("MAIL_INGEST_MODE", "parser"),
            ("POLL_INTERVAL_SECONDS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, ref message }
                if key == "POLL_INTERVAL_SECONDS" && message.contains("greater than zero")
        ));
    }

    #[test]
    fn openai_key_selects_model_backend() {
        let config = IngestConfig::from_vars(lookup(&[
            ("MAIL_INGEST_MODE", "parser"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        let llm = config.classifier.llm.unwrap();
        assert_eq!(llm.backend, LlmBackend::OpenAi);
        assert_eq!(llm.model, "gpt-4o-mini");
    }

    #[test]
    fn unknown_mode_is_invalid() {
        assert!("sideways".parse::<RunMode>().is_err());
        assert_eq!("Fetcher".parse::<RunMode>().unwrap(), RunMode::Fetcher);
    }
}
