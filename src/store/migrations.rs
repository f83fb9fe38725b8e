//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

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
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                recipient_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                read_status TEXT,
                sent_at TEXT,
                send_attempt_id TEXT,
                reminders_enabled INTEGER NOT NULL DEFAULT 0,
                reminders_approved INTEGER NOT NULL DEFAULT 0,
                reminder_start_delay_hours INTEGER NOT NULL DEFAULT 72,
                reminder_frequency_hours INTEGER NOT NULL DEFAULT 72,
                reminder_max_count INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);

            CREATE TABLE IF NOT EXISTS send_attempts (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                idempotency_key TEXT UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_send_attempts_request ON send_attempts(request_id);

            CREATE TABLE IF NOT EXISTS outbound_messages (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                provider_message_id TEXT,
                provider_thread_id TEXT,
                message_id_header TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_header ON outbound_messages(message_id_header);
            CREATE INDEX IF NOT EXISTS idx_outbound_thread ON outbound_messages(provider_thread_id);
            CREATE INDEX IF NOT EXISTS idx_outbound_request ON outbound_messages(request_id);

            CREATE TABLE IF NOT EXISTS inbound_messages (
                id TEXT PRIMARY KEY,
                request_id TEXT,
                sender TEXT NOT NULL,
                subject TEXT,
                body TEXT,
                html_body TEXT,
                provider_message_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_thread_id TEXT,
                is_auto_reply INTEGER NOT NULL DEFAULT 0,
                classification TEXT NOT NULL,
                attachment_refs TEXT NOT NULL DEFAULT '[]',
                received_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (provider_message_id, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_request ON inbound_messages(request_id);

            CREATE TABLE IF NOT EXISTS reminder_states (
                request_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                reminder_number INTEGER NOT NULL DEFAULT 0,
                sent_count INTEGER NOT NULL DEFAULT 0,
                next_send_at TEXT,
                last_sent_at TEXT,
                stopped_reason TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (request_id, recipient)
            );
            CREATE INDEX IF NOT EXISTS idx_reminder_next_send ON reminder_states(next_send_at);

            CREATE TABLE IF NOT EXISTS connected_accounts (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                email TEXT NOT NULL,
                credentials TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                sync_cursor TEXT NOT NULL DEFAULT '{}',
                last_sync_at TEXT,
                token_expires_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_active ON connected_accounts(is_active);

            CREATE TABLE IF NOT EXISTS queued_emails (
                id TEXT PRIMARY KEY,
                to_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                next_attempt_at TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_queued_status_due ON queued_emails(status, next_attempt_at);
        "#,
    },
    Migration {
        version: 2,
        name: "dead_letters",
        sql: r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                provider_message_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                sender_hash TEXT NOT NULL,
                subject TEXT,
                reason TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_dead_letters_provider ON dead_letters(provider);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!("Database migrations complete (at V{})", {
        let v = get_current_version(conn).await?;
        if v == 0 {
            MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
        } else {
            v
        }
    });

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
