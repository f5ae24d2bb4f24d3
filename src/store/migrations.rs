//! Version-tracked database migrations for the libSQL backend.
//!
//! `MIGRATIONS` is append-only. `run_migrations()` applies every step newer
//! than the recorded version, in order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT,
                provider TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                cc_addr TEXT,
                subject TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                raw_headers TEXT NOT NULL,
                raw_body TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (provider, external_id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_sent_at ON records(sent_at);
            CREATE INDEX IF NOT EXISTS idx_records_processed ON records(processed);

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_record ON attachments(record_id);

            CREATE TABLE IF NOT EXISTS classifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
                category TEXT,
                sentiment TEXT,
                summary TEXT,
                confidence_score REAL NOT NULL
                    CHECK (confidence_score >= 0.0 AND confidence_score <= 1.0),
                source_kind TEXT NOT NULL CHECK (source_kind IN ('model', 'fallback')),
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_classifications_record ON classifications(record_id);
            CREATE INDEX IF NOT EXISTS idx_classifications_category ON classifications(category);
        "#,
    },
];

fn migration_err(context: &str) -> impl FnOnce(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the newest version.
///
/// Each step runs in its own transaction together with its `_migrations`
/// row, so a failed step leaves the previous version intact.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .await
    .map_err(migration_err("create _migrations"))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying migration");
        apply(conn, step).await?;
    }
    let version = applied_version(conn).await?;
    tracing::info!(version, "Schema migrated");
    Ok(())
}

async fn apply(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    let label = format!("V{} {}", step.version, step.name);
    let sql = format!(
        "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
        step.sql, step.version, step.name
    );
    if let Err(e) = conn.execute_batch(&sql).await {
        // execute_batch stops at the failing statement; close the transaction.
        let _ = conn.execute("ROLLBACK", ()).await;
        return Err(migration_err(&label)(e));
    }
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(migration_err("read schema version"))?;
    match rows.next().await.map_err(migration_err("read schema version"))? {
        Some(row) => row.get(0).map_err(migration_err("decode schema version")),
        None => Ok(0),
    }
}
