//! libSQL backend — async `Store` trait implementation.
//!
//! One reused connection; `libsql::Connection` is `Send + Sync` and safe
//! for concurrent async use. All exclusivity is enforced by the SQL
//! itself: conditional updates return their affected-row count, which is
//! the compare-and-swap result the callers branch on.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    AccountCredentials, Classification, ConnectedAccount, OutboundMessage, Provider, QueueStatus,
    QueuedEmail, ReadStatus, ReminderConfig, ReminderState, Request, RequestStatus, StopReason,
    StoredInbound,
};
use crate::store::migrations;
use crate::store::traits::{DeadLetter, RequestStore, SendAttempt, Store};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
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
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

// ── Row mappers ─────────────────────────────────────────────────────

const REQUEST_COLUMNS: &str = "id, recipient_email, subject, body, status, read_status, sent_at, send_attempt_id, reminders_enabled, reminders_approved, reminder_start_delay_hours, reminder_frequency_hours, reminder_max_count";

fn row_to_request(row: &libsql::Row) -> Result<Request, libsql::Error> {
    let status_str: String = row.get(4)?;
    let read_status_str: Option<String> = row.get(5).ok();
    let sent_at_str: Option<String> = row.get(6).ok();
    let attempt_str: Option<String> = row.get(7).ok();

    Ok(Request {
        id: row.get(0)?,
        recipient_email: row.get(1)?,
        subject: row.get(2)?,
        body: row.get(3)?,
        status: RequestStatus::parse(&status_str),
        read_status: read_status_str.as_deref().and_then(ReadStatus::parse),
        sent_at: parse_optional_datetime(&sent_at_str),
        send_attempt_id: attempt_str.as_deref().map(parse_uuid),
        reminder_config: ReminderConfig {
            enabled: row.get::<i64>(8)? != 0,
            approved: row.get::<i64>(9)? != 0,
            start_delay_hours: row.get(10)?,
            frequency_hours: row.get(11)?,
            max_count: row.get::<i64>(12)? as u32,
        },
    })
}

const OUTBOUND_COLUMNS: &str =
    "id, request_id, recipient, subject, body, provider_message_id, provider_thread_id, message_id_header, sent_at";

fn row_to_outbound(row: &libsql::Row) -> Result<OutboundMessage, libsql::Error> {
    let id_str: String = row.get(0)?;
    let sent_str: String = row.get(8)?;
    Ok(OutboundMessage {
        id: parse_uuid(&id_str),
        request_id: row.get(1)?,
        recipient: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        provider_message_id: row.get(5).ok(),
        provider_thread_id: row.get(6).ok(),
        message_id_header: row.get(7)?,
        sent_at: parse_datetime(&sent_str),
    })
}

const INBOUND_COLUMNS: &str =
    "id, request_id, sender, subject, body, html_body, provider_message_id, provider, provider_thread_id, is_auto_reply, classification, attachment_refs, received_at";

fn row_to_inbound(row: &libsql::Row) -> Result<StoredInbound, libsql::Error> {
    let id_str: String = row.get(0)?;
    let classification_str: String = row.get(10)?;
    let refs_str: String = row.get::<String>(11).unwrap_or_else(|_| "[]".into());
    let received_str: String = row.get(12)?;
    Ok(StoredInbound {
        id: parse_uuid(&id_str),
        request_id: row.get(1).ok(),
        sender: row.get(2)?,
        subject: row.get(3).ok(),
        body: row.get(4).ok(),
        html_body: row.get(5).ok(),
        provider_message_id: row.get(6)?,
        provider: row.get(7)?,
        provider_thread_id: row.get(8).ok(),
        is_auto_reply: row.get::<i64>(9)? != 0,
        classification: Classification::parse(&classification_str),
        attachment_refs: serde_json::from_str(&refs_str).unwrap_or_default(),
        received_at: parse_datetime(&received_str),
    })
}

const REMINDER_COLUMNS: &str = "request_id, recipient, reminder_number, sent_count, next_send_at, last_sent_at, stopped_reason, created_at, updated_at";

fn row_to_reminder(row: &libsql::Row) -> Result<ReminderState, libsql::Error> {
    let next_str: Option<String> = row.get(4).ok();
    let last_str: Option<String> = row.get(5).ok();
    let reason_str: Option<String> = row.get(6).ok();
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;
    Ok(ReminderState {
        request_id: row.get(0)?,
        recipient: row.get(1)?,
        reminder_number: row.get::<i64>(2)? as u32,
        sent_count: row.get::<i64>(3)? as u32,
        next_send_at: parse_optional_datetime(&next_str),
        last_sent_at: parse_optional_datetime(&last_str),
        stopped_reason: reason_str.as_deref().and_then(StopReason::parse),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const ACCOUNT_COLUMNS: &str =
    "id, provider, email, credentials, is_active, sync_cursor, last_sync_at, token_expires_at";

fn row_to_account(row: &libsql::Row) -> Result<ConnectedAccount, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("account row: {e}")))?;
    let provider_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("account row: {e}")))?;
    let provider = Provider::parse(&provider_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown provider '{provider_str}'"))
    })?;
    let email: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("account row: {e}")))?;
    let credentials_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("account row: {e}")))?;
    let credentials: AccountCredentials = serde_json::from_str(&credentials_str)
        .map_err(|e| DatabaseError::Serialization(format!("account credentials: {e}")))?;
    let is_active: i64 = row.get(4).unwrap_or(0);
    let cursor_str: String = row.get::<String>(5).unwrap_or_else(|_| "{}".into());
    let sync_cursor: BTreeMap<String, String> =
        serde_json::from_str(&cursor_str).unwrap_or_default();
    let last_sync_str: Option<String> = row.get(6).ok();
    let expires_str: Option<String> = row.get(7).ok();

    Ok(ConnectedAccount {
        id: parse_uuid(&id_str),
        provider,
        email,
        credentials,
        is_active: is_active != 0,
        sync_cursor,
        last_sync_at: parse_optional_datetime(&last_sync_str),
        token_expires_at: parse_optional_datetime(&expires_str),
    })
}

const QUEUED_COLUMNS: &str = "id, to_email, subject, body, status, attempts, max_attempts, next_attempt_at, last_error, created_at, updated_at";

fn row_to_queued(row: &libsql::Row) -> Result<QueuedEmail, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(4)?;
    let next_str: String = row.get(7)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;
    Ok(QueuedEmail {
        id: parse_uuid(&id_str),
        to_email: row.get(1)?,
        subject: row.get(2)?,
        body: row.get(3)?,
        status: QueueStatus::parse(&status_str),
        attempts: row.get::<i64>(5)? as u32,
        max_attempts: row.get::<i64>(6)? as u32,
        next_attempt_at: parse_datetime(&next_str),
        last_error: row.get(8).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── RequestStore ────────────────────────────────────────────────────

#[async_trait]
impl RequestStore for LibSqlBackend {
    async fn insert_request(&self, request: &Request) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO requests (id, recipient_email, subject, body, status, read_status, sent_at, send_attempt_id, reminders_enabled, reminders_approved, reminder_start_delay_hours, reminder_frequency_hours, reminder_max_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    request.id.clone(),
                    request.recipient_email.clone(),
                    request.subject.clone(),
                    request.body.clone(),
                    request.status.as_str(),
                    opt_text(request.read_status.map(|r| r.as_str())),
                    opt_datetime(request.sent_at),
                    opt_text(request.send_attempt_id.map(|u| u.to_string()).as_deref()),
                    request.reminder_config.enabled as i64,
                    request.reminder_config.approved as i64,
                    request.reminder_config.start_delay_hours,
                    request.reminder_config.frequency_hours,
                    request.reminder_config.max_count as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_request", e))?;
        Ok(())
    }

    async fn find_request(&self, id: &str) -> Result<Option<Request>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_request: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let request = row_to_request(&row)
                    .map_err(|e| DatabaseError::Query(format!("find_request row parse: {e}")))?;
                Ok(Some(request))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_request: {e}"))),
        }
    }

    async fn mark_request_sent(
        &self,
        id: &str,
        send_attempt_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE requests SET status = 'sent', sent_at = ?2, send_attempt_id = ?3, updated_at = ?4 WHERE id = ?1 AND sent_at IS NULL",
                params![
                    id,
                    sent_at.to_rfc3339(),
                    send_attempt_id.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_request_sent: {e}")))?;

        debug!(request_id = id, affected, "Conditional sent-write applied");
        Ok(affected)
    }

    async fn update_request_status(
        &self,
        id: &str,
        status: RequestStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE requests SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_request_status: {e}")))?;
        Ok(())
    }

    async fn set_request_read_status(
        &self,
        id: &str,
        read_status: ReadStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE requests SET read_status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, read_status.as_str(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_request_read_status: {e}")))?;
        Ok(())
    }

    async fn store_reminder_snapshot(
        &self,
        id: &str,
        config: &ReminderConfig,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE requests SET reminders_enabled = ?2, reminders_approved = ?3, reminder_start_delay_hours = ?4, reminder_frequency_hours = ?5, reminder_max_count = ?6, updated_at = ?7 WHERE id = ?1",
                params![
                    id,
                    config.enabled as i64,
                    config.approved as i64,
                    config.start_delay_hours,
                    config.frequency_hours,
                    config.max_count as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_reminder_snapshot: {e}")))?;
        Ok(())
    }
}

// ── Store ───────────────────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn insert_send_attempt(
        &self,
        id: Uuid,
        request_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO send_attempts (id, request_id, idempotency_key, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    request_id,
                    opt_text(idempotency_key),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_send_attempt", e))?;
        Ok(())
    }

    async fn find_send_attempt_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<SendAttempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, request_id, idempotency_key, created_at FROM send_attempts WHERE idempotency_key = ?1",
                params![idempotency_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_send_attempt_by_key: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("attempt row: {e}")))?;
                let created_str: String = row.get(3).unwrap_or_default();
                Ok(Some(SendAttempt {
                    id: parse_uuid(&id_str),
                    request_id: row
                        .get(1)
                        .map_err(|e| DatabaseError::Query(format!("attempt row: {e}")))?,
                    idempotency_key: row.get(2).ok(),
                    created_at: parse_datetime(&created_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_send_attempt_by_key: {e}"
            ))),
        }
    }

    async fn insert_outbound(&self, message: &OutboundMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO outbound_messages (id, request_id, recipient, subject, body, provider_message_id, provider_thread_id, message_id_header, sent_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id.to_string(),
                    message.request_id.clone(),
                    message.recipient.clone(),
                    message.subject.clone(),
                    message.body.clone(),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(message.provider_thread_id.as_deref()),
                    message.message_id_header.clone(),
                    message.sent_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_outbound", e))?;

        debug!(id = %message.id, request_id = %message.request_id, "Outbound message recorded");
        Ok(())
    }

    async fn backfill_outbound_provider_ids(
        &self,
        id: Uuid,
        provider_message_id: Option<&str>,
        provider_thread_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE outbound_messages SET provider_message_id = COALESCE(?2, provider_message_id), provider_thread_id = COALESCE(?3, provider_thread_id) WHERE id = ?1",
                params![
                    id.to_string(),
                    opt_text(provider_message_id),
                    opt_text(provider_thread_id),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("backfill_outbound_provider_ids: {e}")))?;
        Ok(())
    }

    async fn find_outbound_by_message_id_header(
        &self,
        header: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_messages WHERE message_id_header = ?1 OR message_id_header = '<' || ?1 || '>' LIMIT 1"
                ),
                params![header],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_outbound_by_message_id_header: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outbound(&row).map_err(|e| {
                DatabaseError::Query(format!("outbound row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_outbound_by_message_id_header: {e}"
            ))),
        }
    }

    async fn find_outbound_by_thread_id(
        &self,
        thread_id: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_messages WHERE provider_thread_id = ?1 ORDER BY sent_at DESC LIMIT 1"
                ),
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_outbound_by_thread_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outbound(&row).map_err(|e| {
                DatabaseError::Query(format!("outbound row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_outbound_by_thread_id: {e}"
            ))),
        }
    }

    async fn find_latest_outbound_by_subject(
        &self,
        stripped_subject: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_messages WHERE length(subject) > 0 AND instr(lower(?1), lower(subject)) > 0 ORDER BY sent_at DESC LIMIT 1"
                ),
                params![stripped_subject],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_latest_outbound_by_subject: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outbound(&row).map_err(|e| {
                DatabaseError::Query(format!("outbound row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_latest_outbound_by_subject: {e}"
            ))),
        }
    }

    async fn inbound_exists(
        &self,
        provider_message_id: &str,
        provider: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM inbound_messages WHERE provider_message_id = ?1 AND provider = ?2",
                params![provider_message_id, provider],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("inbound_exists: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            _ => Ok(false),
        }
    }

    async fn insert_inbound(&self, message: &StoredInbound) -> Result<(), DatabaseError> {
        let refs = serde_json::to_string(&message.attachment_refs)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO inbound_messages (id, request_id, sender, subject, body, html_body, provider_message_id, provider, provider_thread_id, is_auto_reply, classification, attachment_refs, received_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    message.id.to_string(),
                    opt_text(message.request_id.as_deref()),
                    message.sender.clone(),
                    opt_text(message.subject.as_deref()),
                    opt_text(message.body.as_deref()),
                    opt_text(message.html_body.as_deref()),
                    message.provider_message_id.clone(),
                    message.provider.clone(),
                    opt_text(message.provider_thread_id.as_deref()),
                    message.is_auto_reply as i64,
                    message.classification.as_str(),
                    refs,
                    message.received_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_inbound", e))?;

        debug!(id = %message.id, provider = %message.provider, "Inbound message recorded");
        Ok(())
    }

    async fn get_inbound(&self, id: Uuid) -> Result<Option<StoredInbound>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INBOUND_COLUMNS} FROM inbound_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_inbound: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_inbound(&row).map_err(|e| {
                DatabaseError::Query(format!("inbound row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_inbound: {e}"))),
        }
    }

    async fn list_inbound_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<StoredInbound>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INBOUND_COLUMNS} FROM inbound_messages WHERE request_id = ?1 ORDER BY received_at ASC"
                ),
                params![request_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_inbound_for_request: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_inbound(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!("Skipping inbound row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn get_reminder_state(
        &self,
        request_id: &str,
        recipient: &str,
    ) -> Result<Option<ReminderState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REMINDER_COLUMNS} FROM reminder_states WHERE request_id = ?1 AND recipient = ?2"
                ),
                params![request_id, recipient],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_reminder_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_reminder(&row).map_err(|e| {
                DatabaseError::Query(format!("reminder row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_reminder_state: {e}"))),
        }
    }

    async fn insert_reminder_state(&self, state: &ReminderState) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO reminder_states (request_id, recipient, reminder_number, sent_count, next_send_at, last_sent_at, stopped_reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    state.request_id.clone(),
                    state.recipient.clone(),
                    state.reminder_number as i64,
                    state.sent_count as i64,
                    opt_datetime(state.next_send_at),
                    opt_datetime(state.last_sent_at),
                    opt_text(state.stopped_reason.map(|r| r.as_str())),
                    state.created_at.to_rfc3339(),
                    state.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_reminder_state", e))?;
        Ok(())
    }

    async fn stop_reminder(
        &self,
        request_id: &str,
        recipient: &str,
        reason: StopReason,
    ) -> Result<u64, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE reminder_states SET next_send_at = NULL, stopped_reason = ?3, updated_at = ?4 WHERE request_id = ?1 AND recipient = ?2 AND stopped_reason IS NULL",
                params![
                    request_id,
                    recipient,
                    reason.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stop_reminder: {e}")))?;
        Ok(affected)
    }

    async fn record_reminder_sent(
        &self,
        request_id: &str,
        recipient: &str,
        sent_at: DateTime<Utc>,
        next_send_at: Option<DateTime<Utc>>,
        stopped_reason: Option<StopReason>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE reminder_states SET sent_count = sent_count + 1, reminder_number = reminder_number + 1, last_sent_at = ?3, next_send_at = ?4, stopped_reason = COALESCE(stopped_reason, ?5), updated_at = ?6 WHERE request_id = ?1 AND recipient = ?2",
                params![
                    request_id,
                    recipient,
                    sent_at.to_rfc3339(),
                    opt_datetime(next_send_at),
                    opt_text(stopped_reason.map(|r| r.as_str())),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_reminder_sent: {e}")))?;
        Ok(())
    }

    async fn list_due_reminders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReminderState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REMINDER_COLUMNS} FROM reminder_states WHERE next_send_at IS NOT NULL AND next_send_at <= ?1 ORDER BY next_send_at ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_reminders: {e}")))?;

        let mut states = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_reminder(&row) {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!("Skipping reminder row: {e}"),
            }
        }
        Ok(states)
    }

    async fn insert_account(&self, account: &ConnectedAccount) -> Result<(), DatabaseError> {
        let credentials = serde_json::to_string(&account.credentials)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let cursor = serde_json::to_string(&account.sync_cursor)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO connected_accounts (id, provider, email, credentials, is_active, sync_cursor, last_sync_at, token_expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    account.id.to_string(),
                    account.provider.as_str(),
                    account.email.clone(),
                    credentials,
                    account.is_active as i64,
                    cursor,
                    opt_datetime(account.last_sync_at),
                    opt_datetime(account.token_expires_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_account", e))?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<ConnectedAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM connected_accounts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_account(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account: {e}"))),
        }
    }

    async fn list_active_accounts(&self) -> Result<Vec<ConnectedAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM connected_accounts WHERE is_active = 1 ORDER BY email"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_accounts: {e}")))?;

        let mut accounts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_account(&row) {
                Ok(account) => accounts.push(account),
                Err(e) => tracing::warn!("Skipping account row: {e}"),
            }
        }
        Ok(accounts)
    }

    async fn merge_sync_cursor(
        &self,
        account_id: Uuid,
        provider: &str,
        cursor: &str,
        last_sync_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        // json_set updates one key in place, so another provider's cursor
        // written between our read and this write is preserved.
        self.conn()
            .execute(
                "UPDATE connected_accounts SET sync_cursor = json_set(COALESCE(sync_cursor, '{}'), '$.' || ?2, ?3), last_sync_at = ?4, updated_at = ?4 WHERE id = ?1",
                params![
                    account_id.to_string(),
                    provider,
                    cursor,
                    last_sync_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("merge_sync_cursor: {e}")))?;
        Ok(())
    }

    async fn update_account_credentials(
        &self,
        id: Uuid,
        credentials: &AccountCredentials,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let credentials = serde_json::to_string(credentials)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE connected_accounts SET credentials = ?2, token_expires_at = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id.to_string(),
                    credentials,
                    opt_datetime(token_expires_at),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_account_credentials: {e}")))?;
        Ok(())
    }

    async fn deactivate_account(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE connected_accounts SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deactivate_account: {e}")))?;
        Ok(())
    }

    async fn enqueue_email(&self, email: &QueuedEmail) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO queued_emails (id, to_email, subject, body, status, attempts, max_attempts, next_attempt_at, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    email.id.to_string(),
                    email.to_email.clone(),
                    email.subject.clone(),
                    email.body.clone(),
                    email.status.as_str(),
                    email.attempts as i64,
                    email.max_attempts as i64,
                    email.next_attempt_at.to_rfc3339(),
                    opt_text(email.last_error.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("enqueue_email", e))?;
        Ok(())
    }

    async fn get_queued(&self, id: Uuid) -> Result<Option<QueuedEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {QUEUED_COLUMNS} FROM queued_emails WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_queued: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_queued(&row).map_err(|e| {
                DatabaseError::Query(format!("queued row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_queued: {e}"))),
        }
    }

    async fn claim_queued(&self, id: Uuid) -> Result<u64, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE queued_emails SET status = 'processing', updated_at = ?2 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_queued: {e}")))?;
        Ok(affected)
    }

    async fn mark_queued_sent(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queued_emails SET status = 'sent', updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_queued_sent: {e}")))?;
        Ok(())
    }

    async fn requeue_after_failure(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queued_emails SET status = 'pending', attempts = ?2, next_attempt_at = ?3, last_error = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    id.to_string(),
                    attempts as i64,
                    next_attempt_at.to_rfc3339(),
                    last_error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_after_failure: {e}")))?;
        Ok(())
    }

    async fn mark_queued_failed(
        &self,
        id: Uuid,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queued_emails SET status = 'failed', attempts = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id.to_string(),
                    attempts as i64,
                    last_error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_queued_failed: {e}")))?;
        Ok(())
    }

    async fn cancel_queued(&self, id: Uuid) -> Result<u64, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE queued_emails SET status = 'cancelled', updated_at = ?2 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_queued: {e}")))?;
        Ok(affected)
    }

    async fn list_due_queued(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUED_COLUMNS} FROM queued_emails WHERE status = 'pending' AND next_attempt_at <= ?1 ORDER BY next_attempt_at ASC LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_queued: {e}")))?;

        let mut emails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_queued(&row) {
                Ok(email) => emails.push(email),
                Err(e) => tracing::warn!("Skipping queued row: {e}"),
            }
        }
        Ok(emails)
    }

    async fn rearm_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE queued_emails SET status = 'pending', updated_at = ?2 WHERE status = 'processing' AND updated_at < ?1",
                params![older_than.to_rfc3339(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("rearm_stale_processing: {e}")))?;

        if affected > 0 {
            info!(count = affected, "Re-armed stale PROCESSING queue rows");
        }
        Ok(affected)
    }

    async fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<(), DatabaseError> {
        let payload = letter
            .payload
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok());
        self.conn()
            .execute(
                "INSERT INTO dead_letters (id, provider_message_id, provider, sender_hash, subject, reason, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    letter.id.to_string(),
                    letter.provider_message_id.clone(),
                    letter.provider.clone(),
                    letter.sender_hash.clone(),
                    opt_text(letter.subject.as_deref()),
                    letter.reason.clone(),
                    opt_text(payload.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_dead_letter", e))?;
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, provider_message_id, provider, sender_hash, subject, reason, payload FROM dead_letters ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dead_letters: {e}")))?;

        let mut letters = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let payload_str: Option<String> = row.get(6).ok();
            letters.push(DeadLetter {
                id: parse_uuid(&id_str),
                provider_message_id: row.get(1).unwrap_or_default(),
                provider: row.get(2).unwrap_or_default(),
                sender_hash: row.get(3).unwrap_or_default(),
                subject: row.get(4).ok(),
                reason: row.get(5).unwrap_or_default(),
                payload: payload_str.and_then(|s| serde_json::from_str(&s).ok()),
            });
        }
        Ok(letters)
    }
}
