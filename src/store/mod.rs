//! Persistence layer: libSQL-backed storage for records, attachments, and verdicts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlRepository;
pub use traits::{
    RecordFilter, RecordView, Repository, StoredAttachment, StoredRecord, StoredVerdict,
};
