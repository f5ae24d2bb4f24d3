//! Message ingestion pipeline.
//!
//! Fetcher side:
//! 1. `MessageSource::fetch_unread()`: mailbox I/O
//! 2. `IngestionOrchestrator::run_cycle()`: submit each message across the boundary
//! 3. `MessageSource::acknowledge()`: only after a success response
//!
//! Parser side (`ParseService`):
//! 1. `normalize()`: raw blob to `NormalizedRecord`, no I/O
//! 2. `Classifier::classify()`: model verdict, keyword rules on any failure
//! 3. `Repository::ingest()`: one transaction for record, attachments, verdict
//!
//! **No message is acknowledged before it is durably stored.**

pub mod classifier;
pub mod normalizer;
pub mod orchestrator;
pub mod processor;
pub mod rules;
pub mod types;
