//! Mail ingest: mailbox polling, normalization, classification, storage.

pub mod boundary;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
