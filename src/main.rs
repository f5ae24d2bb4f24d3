use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use mail_ingest::boundary::{
    AppState, HttpBoundary, LocalBoundary, ProcessingBoundary, parser_routes,
};
use mail_ingest::channels::ImapSource;
use mail_ingest::config::{IngestConfig, RunMode};
use mail_ingest::pipeline::classifier::build_classifier;
use mail_ingest::pipeline::orchestrator::{IngestionOrchestrator, spawn_ingest_loop};
use mail_ingest::pipeline::processor::ParseService;
use mail_ingest::store::{LibSqlRepository, Repository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = match IngestConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = setup_logging(config.log_dir.as_deref());

    eprintln!("📬 Mail Ingest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {:?}", config.mode);

    // ── Parser side ─────────────────────────────────────────────────────
    let service = if config.mode.runs_parser() {
        let repo: Arc<dyn Repository> = Arc::new(
            LibSqlRepository::new_local(&config.parser.db_path)
                .await
                .with_context(|| {
                    format!("Failed to open database at {}", config.parser.db_path.display())
                })?,
        );
        eprintln!("   Database: {}", config.parser.db_path.display());

        let classifier = build_classifier(&config.classifier);
        eprintln!("   Classifier: {}", classifier.name());

        let service = Arc::new(ParseService::new(classifier, repo));

        let app = parser_routes(AppState::new(Arc::clone(&service)));
        let listener = tokio::net::TcpListener::bind(&config.parser.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.parser.bind_addr))?;
        eprintln!("   Parser API: http://{}", config.parser.bind_addr);
        tokio::spawn(async move {
            info!("Parser server started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Parser server stopped");
            }
        });

        Some(service)
    } else {
        None
    };

    // ── Fetcher side ────────────────────────────────────────────────────
    let ingest = if config.mode.runs_fetcher() {
        let mailbox = config
            .mailbox
            .clone()
            .context("Mailbox configuration missing for fetcher mode")?;

        let boundary: Arc<dyn ProcessingBoundary> = match (&service, config.mode) {
            (Some(service), RunMode::All) => Arc::new(LocalBoundary::new(Arc::clone(service))),
            _ => {
                eprintln!("   Parser URL: {}", config.fetcher.parser_url);
                Arc::new(HttpBoundary::new(
                    &config.fetcher.parser_url,
                    config.fetcher.boundary_timeout,
                )?)
            }
        };

        eprintln!(
            "   Mailbox: {}@{}:{}/{} every {}s",
            mailbox.username,
            mailbox.imap_host,
            mailbox.imap_port,
            mailbox.mailbox,
            config.fetcher.poll_interval.as_secs()
        );

        let lookback = mailbox.lookback;
        let orchestrator =
            IngestionOrchestrator::new(Box::new(ImapSource::new(mailbox)), boundary, lookback);
        Some(spawn_ingest_loop(orchestrator, config.fetcher.poll_interval))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    if let Some((handle, shutdown)) = ingest {
        shutdown.trigger();
        if tokio::time::timeout(std::time::Duration::from_secs(30), handle)
            .await
            .is_err()
        {
            warn!("Ingest loop did not stop within 30s");
        }
    }

    Ok(())
}

/// Set up tracing with stderr output and, when configured, a daily log file.
/// The returned guard must live as long as the process to flush the file.
fn setup_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    if let Some(dir) = log_dir
        && std::fs::create_dir_all(dir).is_ok()
    {
        let appender = tracing_appender::rolling::daily(dir, "mail-ingest.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        None
    }
}
