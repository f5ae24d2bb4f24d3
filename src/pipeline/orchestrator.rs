//! Fetch cycle driver.
//!
//! One cycle: connect → fetch unread → submit each → acknowledge only the
//! ones that came back successful → disconnect. A failed submit leaves the
//! message unread so the next cycle picks it up again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::boundary::ProcessingBoundary;
use crate::channels::MessageSource;

/// Counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Connection opened.
    pub connected: bool,
    pub fetched: usize,
    /// Submitted and confirmed durable.
    pub processed: usize,
    pub acknowledged: usize,
    pub failed: usize,
}

/// Drives a message source into a processing boundary.
pub struct IngestionOrchestrator {
    source: Box<dyn MessageSource>,
    boundary: Arc<dyn ProcessingBoundary>,
    lookback: Duration,
}

impl IngestionOrchestrator {
    pub fn new(
        source: Box<dyn MessageSource>,
        boundary: Arc<dyn ProcessingBoundary>,
        lookback: Duration,
    ) -> Self {
        Self {
            source,
            boundary,
            lookback,
        }
    }

    /// Run one fetch cycle. Never fails; problems are logged and counted.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("ingest_cycle", %cycle_id, source = self.source.name());
        self.cycle().instrument(span).await
    }

    async fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        if !self.source.connect().await {
            warn!("Could not connect to mailbox, skipping cycle");
            return report;
        }
        report.connected = true;

        let messages = self.source.fetch_unread(self.lookback).await;
        report.fetched = messages.len();
        debug!(count = messages.len(), "Fetched unread messages");

        for message in &messages {
            let request = message.to_parse_request();
            match self.boundary.submit(&request).await {
                Ok(response) if response.is_success() => {
                    report.processed += 1;
                    if self.source.acknowledge(&message.source_id).await {
                        report.acknowledged += 1;
                    } else {
                        // Stored already; a re-fetch upserts onto the same record.
                        warn!(source_id = %message.source_id, "Acknowledge failed");
                    }
                }
                Ok(response) => {
                    report.failed += 1;
                    warn!(
                        source_id = %message.source_id,
                        status = %response.status,
                        "Parser did not confirm message, leaving unread"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        source_id = %message.source_id,
                        error = %e,
                        "Submit failed, leaving unread"
                    );
                }
            }
        }

        self.source.disconnect().await;

        info!(
            fetched = report.fetched,
            processed = report.processed,
            acknowledged = report.acknowledged,
            failed = report.failed,
            "Cycle complete"
        );
        report
    }
}

/// Stops a running ingest loop.
#[derive(Clone, Default)]
pub struct LoopShutdown {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl LoopShutdown {
    /// Ask the loop to stop. A waiting loop wakes at once; a running cycle
    /// finishes first.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the polling loop. The first cycle runs immediately.
///
/// Returns a `JoinHandle` and a `LoopShutdown` handle.
pub fn spawn_ingest_loop(
    mut orchestrator: IngestionOrchestrator,
    poll_interval: Duration,
) -> (JoinHandle<()>, LoopShutdown) {
    let shutdown = LoopShutdown::default();
    let stop = shutdown.clone();

    let poll_interval = if poll_interval.is_zero() {
        warn!("Zero poll interval, using {}s", MIN_POLL_INTERVAL.as_secs());
        MIN_POLL_INTERVAL
    } else {
        poll_interval
    };

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = poll_interval.as_secs(),
            source = orchestrator.source.name(),
            "Ingest loop started"
        );

        if !orchestrator.boundary.health().await {
            warn!("Processing boundary not healthy at startup; cycles will retry");
        }

        let mut tick = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stop.wake.notified() => {}
            }

            if stop.is_triggered() {
                info!("Ingest loop shutting down");
                return;
            }

            orchestrator.run_cycle().await;
        }
    });

    (handle, shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::BoundaryError;
    use crate::pipeline::types::{ParseRequest, ParseResponse, RawMessage};

    #[derive(Default)]
    struct Log {
        acked: Vec<String>,
        disconnects: usize,
    }

    struct FakeSource {
        reachable: bool,
        messages: Vec<RawMessage>,
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }
        async fn connect(&mut self) -> bool {
            self.reachable
        }
        async fn fetch_unread(&mut self, _lookback: Duration) -> Vec<RawMessage> {
            self.messages.clone()
        }
        async fn acknowledge(&mut self, source_id: &str) -> bool {
            self.log.lock().unwrap().acked.push(source_id.to_string());
            true
        }
        async fn disconnect(&mut self) {
            self.log.lock().unwrap().disconnects += 1;
        }
    }

    /// Rejects any message whose body contains "reject".
    struct PickyBoundary;

    #[async_trait]
    impl ProcessingBoundary for PickyBoundary {
        async fn submit(&self, request: &ParseRequest) -> Result<ParseResponse, BoundaryError> {
            if request.raw_email.contains("reject") {
                return Err(BoundaryError::Rejected {
                    status: 500,
                    detail: "db down".into(),
                });
            }
            Ok(ParseResponse {
                id: 1,
                from_addr: String::new(),
                to_addr: String::new(),
                subject: String::new(),
                category: None,
                sentiment: None,
                summary: None,
                processed: true,
                status: ParseResponse::SUCCESS.into(),
            })
        }
        async fn health(&self) -> bool {
            true
        }
    }

    fn message(uid: &str, body: &str) -> RawMessage {
        RawMessage::from_blob(uid, "imap", "INBOX", &format!("Subject: t\r\n\r\n{body}"))
    }

    fn orchestrator(reachable: bool, messages: Vec<RawMessage>) -> (IngestionOrchestrator, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let source = FakeSource {
            reachable,
            messages,
            log: Arc::clone(&log),
        };
        let orch = IngestionOrchestrator::new(
            Box::new(source),
            Arc::new(PickyBoundary),
            Duration::from_secs(86_400),
        );
        (orch, log)
    }

    #[tokio::test]
    async fn acknowledges_only_successful_submits() {
        let (mut orch, log) = orchestrator(
            true,
            vec![message("1", "fine"), message("2", "reject me"), message("3", "fine")],
        );

        let report = orch.run_cycle().await;
        assert_eq!(report.fetched, 3);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);

        let log = log.lock().unwrap();
        assert_eq!(log.acked, vec!["1".to_string(), "3".to_string()]);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test]
    async fn unreachable_mailbox_skips_cycle() {
        let (mut orch, log) = orchestrator(false, vec![message("1", "fine")]);
        let report = orch.run_cycle().await;
        assert!(!report.connected);
        assert_eq!(report.fetched, 0);
        assert!(log.lock().unwrap().acked.is_empty());
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let (orch, log) = orchestrator(true, vec![message("1", "fine")]);
        let (handle, shutdown) = spawn_ingest_loop(orch, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();

        assert!(log.lock().unwrap().disconnects >= 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_long_wait() {
        let (orch, log) = orchestrator(true, vec![message("1", "fine")]);
        let (handle, shutdown) = spawn_ingest_loop(orch, Duration::from_secs(3600));

        // Let the immediate first cycle finish, then stop mid-wait.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.lock().unwrap().disconnects, 1);
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop waited out the interval")
            .unwrap();

        assert_eq!(log.lock().unwrap().disconnects, 1);
    }

    #[tokio::test]
    async fn zero_interval_does_not_panic() {
        let (orch, log) = orchestrator(true, vec![message("1", "fine")]);
        let (handle, shutdown) = spawn_ingest_loop(orch, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();

        assert_eq!(log.lock().unwrap().disconnects, 1);
    }
}
