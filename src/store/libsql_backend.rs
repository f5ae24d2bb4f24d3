//! libSQL backend: async `Repository` implementation.
//!
//! Supports local file and in-memory databases. All statements go through a
//! single connection behind an async mutex, so a transaction opened by
//! `ingest` is never interleaved with another caller's statements.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{
    AttachmentMeta, ClassificationVerdict, IngestStats, NormalizedRecord, ProcessingState,
    VerdictSource,
};
use crate::store::migrations;
use crate::store::traits::{
    RecordFilter, RecordView, Repository, StoredAttachment, StoredRecord, StoredVerdict,
};

/// libSQL repository.
pub struct LibSqlRepository {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlRepository {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let repo = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(repo)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Cascades depend on this; it is per-connection in SQLite.
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let repo = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        repo.init_schema().await?;
        Ok(repo)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

const RECORD_COLUMNS: &str = "r.id, r.external_id, r.provider, r.from_addr, r.to_addr, r.cc_addr, \
     r.subject, r.sent_at, r.raw_headers, r.raw_body, r.mailbox, r.processed, r.processed_at, \
     r.error, r.created_at, r.updated_at";

/// Number of columns in `RECORD_COLUMNS`.
const RECORD_COLUMN_COUNT: i32 = 16;

const VERDICT_COLUMNS: &str = "c.id, c.record_id, c.category, c.sentiment, c.summary, \
     c.confidence_score, c.source_kind, c.created_at";

const ATTACHMENT_COLUMNS: &str = "id, record_id, filename, mime_type, size_bytes";

/// Records joined with their latest verdict, filtered by `?1`..`?4`
/// (category, sentiment, processed, search pattern). NULL disables a filter.
const FILTERED_RECORDS: &str = "FROM records r
     LEFT JOIN classifications c
        ON c.id = (SELECT MAX(id) FROM classifications WHERE record_id = r.id)
     WHERE (?1 IS NULL OR c.category = ?1)
       AND (?2 IS NULL OR c.sentiment = ?2)
       AND (?3 IS NULL OR r.processed = ?3)
       AND (?4 IS NULL OR r.subject LIKE ?4 ESCAPE '\\'
            OR r.from_addr LIKE ?4 ESCAPE '\\' OR r.raw_body LIKE ?4 ESCAPE '\\')";

fn filter_values(filter: &RecordFilter) -> [libsql::Value; 4] {
    let processed = match filter.processed {
        Some(p) => libsql::Value::Integer(i64::from(p)),
        None => libsql::Value::Null,
    };
    let search = filter
        .search
        .as_deref()
        .map(|s| format!("%{}%", escape_like(s)));
    [
        opt_text(filter.category.as_deref()),
        opt_text(filter.sentiment.as_deref()),
        processed,
        opt_text(search.as_deref()),
    ]
}

/// Make `%`, `_`, and `\` match literally under `ESCAPE '\'`.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Map a libsql Row to a StoredRecord.
fn row_to_record(row: &libsql::Row) -> Result<StoredRecord, DatabaseError> {
    let processed: i64 = row.get(11).map_err(row_err)?;
    let error: Option<String> = row.get(13).ok();
    let sent_at: String = row.get(7).map_err(row_err)?;
    let processed_at: Option<String> = row.get(12).ok();
    let created_at: String = row.get(14).map_err(row_err)?;
    let updated_at: String = row.get(15).map_err(row_err)?;

    Ok(StoredRecord {
        id: row.get(0).map_err(row_err)?,
        external_id: row.get(1).ok(),
        provider: row.get(2).map_err(row_err)?,
        from_addr: row.get(3).map_err(row_err)?,
        to_addr: row.get(4).map_err(row_err)?,
        cc_addr: row.get(5).ok(),
        subject: row.get(6).map_err(row_err)?,
        sent_at: parse_datetime(&sent_at),
        raw_headers: row.get(8).map_err(row_err)?,
        raw_body: row.get(9).map_err(row_err)?,
        mailbox: row.get(10).map_err(row_err)?,
        state: ProcessingState::from_columns(processed != 0, error),
        processed_at: processed_at.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

/// Map verdict columns starting at `base`. `None` when the LEFT JOIN found
/// no verdict.
fn row_to_verdict(row: &libsql::Row, base: i32) -> Result<Option<StoredVerdict>, DatabaseError> {
    let Ok(id) = row.get::<i64>(base) else {
        return Ok(None);
    };
    let confidence: f64 = row.get(base + 5).map_err(row_err)?;
    let source_kind: String = row.get(base + 6).map_err(row_err)?;
    let created_at: String = row.get(base + 7).map_err(row_err)?;

    Ok(Some(StoredVerdict {
        id,
        record_id: row.get(base + 1).map_err(row_err)?,
        verdict: ClassificationVerdict {
            category: row.get(base + 2).ok(),
            sentiment: row.get(base + 3).ok(),
            summary: row.get(base + 4).ok(),
            confidence_score: confidence as f32,
            source_kind: source_kind
                .parse::<VerdictSource>()
                .map_err(DatabaseError::Query)?,
        },
        created_at: parse_datetime(&created_at),
    }))
}

fn row_to_attachment(row: &libsql::Row) -> Result<StoredAttachment, DatabaseError> {
    let size: i64 = row.get(4).map_err(row_err)?;
    Ok(StoredAttachment {
        id: row.get(0).map_err(row_err)?,
        record_id: row.get(1).map_err(row_err)?,
        meta: AttachmentMeta {
            filename: row.get(2).map_err(row_err)?,
            mime_type: row.get(3).map_err(row_err)?,
            size_bytes: size.max(0) as u64,
        },
    })
}

/// Read a single `RETURNING id` value.
async fn returned_id(mut rows: libsql::Rows, op: &str) -> Result<i64, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}"))),
        Ok(None) => Err(DatabaseError::Query(format!("{op}: no id returned"))),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

// ── Write steps (run on an already-locked connection) ───────────────

async fn upsert_record_in(
    conn: &Connection,
    record: &NormalizedRecord,
    now: &str,
) -> Result<i64, DatabaseError> {
    let rows = conn
        .query(
            "INSERT INTO records (external_id, provider, from_addr, to_addr, cc_addr, subject,
                sent_at, raw_headers, raw_body, mailbox, processed, processed_at, error,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, NULL, ?11, ?11)
             ON CONFLICT (provider, external_id) DO UPDATE SET
                from_addr = excluded.from_addr,
                to_addr = excluded.to_addr,
                cc_addr = excluded.cc_addr,
                subject = excluded.subject,
                sent_at = excluded.sent_at,
                raw_headers = excluded.raw_headers,
                raw_body = excluded.raw_body,
                mailbox = excluded.mailbox,
                processed = 0,
                processed_at = NULL,
                error = NULL,
                updated_at = excluded.updated_at
             RETURNING id",
            params![
                opt_text(record.external_id.as_deref()),
                record.provider.as_str(),
                record.from_addr.as_str(),
                record.to_addr.as_str(),
                opt_text(record.cc_addr.as_deref()),
                record.subject.as_str(),
                record.sent_at.to_rfc3339(),
                record.raw_headers.as_str(),
                record.raw_body.as_str(),
                record.mailbox.as_str(),
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_record: {e}")))?;

    returned_id(rows, "upsert_record").await
}

async fn store_attachments_in(
    conn: &Connection,
    record_id: i64,
    attachments: &[AttachmentMeta],
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM attachments WHERE record_id = ?1",
        params![record_id],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("store_attachments: {e}")))?;

    for attachment in attachments {
        conn.execute(
            "INSERT INTO attachments (record_id, filename, mime_type, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record_id,
                attachment.filename.as_str(),
                attachment.mime_type.as_str(),
                i64::try_from(attachment.size_bytes).unwrap_or(i64::MAX),
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("store_attachments: {e}")))?;
    }
    Ok(())
}

async fn attach_classification_in(
    conn: &Connection,
    record_id: i64,
    verdict: &ClassificationVerdict,
    now: &str,
) -> Result<i64, DatabaseError> {
    let rows = conn
        .query(
            "INSERT INTO classifications (record_id, category, sentiment, summary,
                confidence_score, source_kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             RETURNING id",
            params![
                record_id,
                opt_text(verdict.category.as_deref()),
                opt_text(verdict.sentiment.as_deref()),
                opt_text(verdict.summary.as_deref()),
                f64::from(verdict.confidence_score.clamp(0.0, 1.0)),
                verdict.source_kind.as_str(),
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("attach_classification: {e}")))?;

    returned_id(rows, "attach_classification").await
}

async fn mark_processed_in(
    conn: &Connection,
    record_id: i64,
    now: &str,
) -> Result<(), DatabaseError> {
    let affected = conn
        .execute(
            "UPDATE records SET processed = 1, processed_at = ?2, error = NULL, updated_at = ?2
             WHERE id = ?1",
            params![record_id, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("mark_processed: {e}")))?;

    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity: "record".into(),
            id: record_id.to_string(),
        });
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Repository for LibSqlRepository {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    async fn upsert_record(&self, record: &NormalizedRecord) -> Result<i64, DatabaseError> {
        let conn = self.conn.lock().await;
        upsert_record_in(&conn, record, &Utc::now().to_rfc3339()).await
    }

    async fn store_attachments(
        &self,
        record_id: i64,
        attachments: &[AttachmentMeta],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        store_attachments_in(&conn, record_id, attachments, &Utc::now().to_rfc3339()).await
    }

    async fn attach_classification(
        &self,
        record_id: i64,
        verdict: &ClassificationVerdict,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn.lock().await;
        attach_classification_in(&conn, record_id, verdict, &Utc::now().to_rfc3339()).await
    }

    async fn mark_processed(&self, record_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        mark_processed_in(&conn, record_id, &Utc::now().to_rfc3339()).await
    }

    async fn mark_failed(&self, record_id: i64, reason: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE records SET processed = 0, processed_at = NULL, error = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![record_id, reason, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "record".into(),
                id: record_id.to_string(),
            });
        }
        debug!(record_id, reason, "Record marked failed");
        Ok(())
    }

    async fn ingest(
        &self,
        record: &NormalizedRecord,
        verdict: &ClassificationVerdict,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("begin: {e}")))?;

        let result = async {
            let record_id = upsert_record_in(&conn, record, &now).await?;
            store_attachments_in(&conn, record_id, &record.attachments, &now).await?;
            attach_classification_in(&conn, record_id, verdict, &now).await?;
            mark_processed_in(&conn, record_id, &now).await?;
            Ok::<i64, DatabaseError>(record_id)
        }
        .await;

        let outcome = match result {
            Ok(record_id) => conn
                .execute("COMMIT", ())
                .await
                .map(|_| record_id)
                .map_err(|e| DatabaseError::Transaction(format!("commit: {e}"))),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(record_id) => {
                debug!(
                    record_id,
                    provider = %record.provider,
                    external_id = record.external_id.as_deref().unwrap_or("-"),
                    "Record ingested"
                );
                Ok(record_id)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute("ROLLBACK", ()).await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn delete_record(&self, record_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute("DELETE FROM records WHERE id = ?1", params![record_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_record: {e}")))?;
        Ok(affected > 0)
    }

    async fn get_record(&self, record_id: i64) -> Result<Option<StoredRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM records r WHERE r.id = ?1"),
                params![record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_record: {e}"))),
        }
    }

    async fn get_record_by_external_id(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<StoredRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records r
                     WHERE r.provider = ?1 AND r.external_id = ?2"
                ),
                params![provider, external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_record_by_external_id: {e}"
            ))),
        }
    }

    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<RecordView>, DatabaseError> {
        let conn = self.conn.lock().await;
        let [category, sentiment, processed, search] = filter_values(filter);

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS}, {VERDICT_COLUMNS} {FILTERED_RECORDS}
                     ORDER BY r.sent_at DESC, r.id DESC
                     LIMIT ?5 OFFSET ?6"
                ),
                params![
                    category,
                    sentiment,
                    processed,
                    search,
                    i64::from(filter.limit),
                    i64::from(filter.offset),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_records: {e}")))?;

        let mut views = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let record = match row_to_record(&row) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping record row: {e}");
                    continue;
                }
            };
            let analysis = row_to_verdict(&row, RECORD_COLUMN_COUNT)?;
            views.push(RecordView { record, analysis });
        }
        Ok(views)
    }

    async fn count_records(&self, filter: &RecordFilter) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        let [category, sentiment, processed, search] = filter_values(filter);

        let mut rows = conn
            .query(
                &format!("SELECT COUNT(*) {FILTERED_RECORDS}"),
                params![category, sentiment, processed, search],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_records: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(row_err)?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_records: {e}"))),
        }
    }

    async fn latest_verdict(&self, record_id: i64) -> Result<Option<StoredVerdict>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {VERDICT_COLUMNS} FROM classifications c
                     WHERE c.record_id = ?1 ORDER BY c.id DESC LIMIT 1"
                ),
                params![record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_verdict: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_verdict(&row, 0),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_verdict: {e}"))),
        }
    }

    async fn list_verdicts(&self, record_id: i64) -> Result<Vec<StoredVerdict>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {VERDICT_COLUMNS} FROM classifications c
                     WHERE c.record_id = ?1 ORDER BY c.id ASC"
                ),
                params![record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_verdicts: {e}")))?;

        let mut verdicts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Some(verdict) = row_to_verdict(&row, 0)? {
                verdicts.push(verdict);
            }
        }
        Ok(verdicts)
    }

    async fn list_attachments(
        &self,
        record_id: i64,
    ) -> Result<Vec<StoredAttachment>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE record_id = ?1 ORDER BY id"
                ),
                params![record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attachments: {e}")))?;

        let mut attachments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            attachments.push(row_to_attachment(&row)?);
        }
        Ok(attachments)
    }

    async fn stats(&self) -> Result<IngestStats, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM records),
                    (SELECT COUNT(DISTINCT record_id) FROM classifications),
                    (SELECT COUNT(*) FROM records WHERE processed = 1)",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?
            .ok_or_else(|| DatabaseError::Query("stats: no row".into()))?;

        let count = |idx: i32| -> Result<u64, DatabaseError> {
            let value: i64 = row.get(idx).map_err(row_err)?;
            Ok(value.max(0) as u64)
        };

        Ok(IngestStats {
            total_records: count(0)?,
            classified_records: count(1)?,
            processed_records: count(2)?,
        })
    }
}
