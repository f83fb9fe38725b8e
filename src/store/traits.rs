//! Backend-agnostic persistence traits.
//!
//! `RequestStore` is the narrow boundary to the parent request entity —
//! mailflow only reads it and performs the conditional writes the dispatch
//! and status paths need. `Store` covers everything the engine owns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    AccountCredentials, ConnectedAccount, OutboundMessage, QueuedEmail, ReadStatus,
    ReminderConfig, ReminderState, Request, RequestStatus, StopReason, StoredInbound,
};

/// One row of the send-attempt ledger. The ledger is the creation-time
/// idempotency guard: at most one row per idempotency key.
#[derive(Debug, Clone)]
pub struct SendAttempt {
    pub id: Uuid,
    pub request_id: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An uncorrelated inbound message retained for manual triage.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub provider_message_id: String,
    pub provider: String,
    /// sha2 digest prefix of the sender address — never the raw address.
    pub sender_hash: String,
    pub subject: Option<String>,
    pub reason: String,
    pub payload: Option<serde_json::Value>,
}

/// Narrow interface to the parent request entity.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert_request(&self, request: &Request) -> Result<(), DatabaseError>;

    async fn find_request(&self, id: &str) -> Result<Option<Request>, DatabaseError>;

    /// Conditional write: set status/sent_at/send_attempt_id only while
    /// `sent_at IS NULL`. Returns the number of rows affected — zero means
    /// a concurrent attempt already won.
    async fn mark_request_sent(
        &self,
        id: &str,
        send_attempt_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    async fn update_request_status(
        &self,
        id: &str,
        status: RequestStatus,
    ) -> Result<(), DatabaseError>;

    /// Record the coarse read marker, independent of the status field.
    async fn set_request_read_status(
        &self,
        id: &str,
        read_status: ReadStatus,
    ) -> Result<(), DatabaseError>;

    /// Persist a durable copy of the reminder configuration on the request.
    async fn store_reminder_snapshot(
        &self,
        id: &str,
        config: &ReminderConfig,
    ) -> Result<(), DatabaseError>;
}

/// Everything the engine persists itself.
#[async_trait]
pub trait Store: RequestStore {
    // ── Send attempts ───────────────────────────────────────────────

    /// Insert a ledger row. Fails with `UniqueViolation` when the
    /// idempotency key is already taken — callers re-fetch and reuse.
    async fn insert_send_attempt(
        &self,
        id: Uuid,
        request_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn find_send_attempt_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<SendAttempt>, DatabaseError>;

    // ── Outbound messages ───────────────────────────────────────────

    async fn insert_outbound(&self, message: &OutboundMessage) -> Result<(), DatabaseError>;

    /// Backfill provider metadata once the provider reports it.
    async fn backfill_outbound_provider_ids(
        &self,
        id: Uuid,
        provider_message_id: Option<&str>,
        provider_thread_id: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Look up by normalized Message-ID header value; matches the bare
    /// value and its angle-bracketed form.
    async fn find_outbound_by_message_id_header(
        &self,
        header: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    async fn find_outbound_by_thread_id(
        &self,
        thread_id: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// Case-insensitive substring match of stored subjects against the
    /// stripped inbound subject; most recently sent match wins.
    async fn find_latest_outbound_by_subject(
        &self,
        stripped_subject: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    // ── Inbound messages ────────────────────────────────────────────

    /// Dedup guard: has a message with this (provider message id,
    /// provider) pair already been recorded?
    async fn inbound_exists(
        &self,
        provider_message_id: &str,
        provider: &str,
    ) -> Result<bool, DatabaseError>;

    /// Insert an inbound row. `UniqueViolation` on the dedup key means a
    /// concurrent ingestion won; callers treat it as a duplicate skip.
    async fn insert_inbound(&self, message: &StoredInbound) -> Result<(), DatabaseError>;

    async fn get_inbound(&self, id: Uuid) -> Result<Option<StoredInbound>, DatabaseError>;

    async fn list_inbound_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<StoredInbound>, DatabaseError>;

    // ── Reminder states ─────────────────────────────────────────────

    async fn get_reminder_state(
        &self,
        request_id: &str,
        recipient: &str,
    ) -> Result<Option<ReminderState>, DatabaseError>;

    /// Insert a state row; `UniqueViolation` when the (request,
    /// recipient) pair already exists.
    async fn insert_reminder_state(&self, state: &ReminderState) -> Result<(), DatabaseError>;

    /// Conditional stop: null out `next_send_at` and set the reason, only
    /// while not already stopped. Returns rows affected.
    async fn stop_reminder(
        &self,
        request_id: &str,
        recipient: &str,
        reason: StopReason,
    ) -> Result<u64, DatabaseError>;

    /// Advance the cadence after a reminder send.
    async fn record_reminder_sent(
        &self,
        request_id: &str,
        recipient: &str,
        sent_at: DateTime<Utc>,
        next_send_at: Option<DateTime<Utc>>,
        stopped_reason: Option<StopReason>,
    ) -> Result<(), DatabaseError>;

    async fn list_due_reminders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReminderState>, DatabaseError>;

    // ── Connected accounts ──────────────────────────────────────────

    async fn insert_account(&self, account: &ConnectedAccount) -> Result<(), DatabaseError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<ConnectedAccount>, DatabaseError>;

    async fn list_active_accounts(&self) -> Result<Vec<ConnectedAccount>, DatabaseError>;

    /// Merge one provider's cursor into the stored cursor map, preserving
    /// every other provider's last-known cursor.
    async fn merge_sync_cursor(
        &self,
        account_id: Uuid,
        provider: &str,
        cursor: &str,
        last_sync_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn update_account_credentials(
        &self,
        id: Uuid,
        credentials: &AccountCredentials,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Terminal deactivation — requires manual reconnection to undo.
    async fn deactivate_account(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Delivery queue ──────────────────────────────────────────────

    async fn enqueue_email(&self, email: &QueuedEmail) -> Result<(), DatabaseError>;

    async fn get_queued(&self, id: Uuid) -> Result<Option<QueuedEmail>, DatabaseError>;

    /// Conditional claim: PENDING → PROCESSING. Returns rows affected —
    /// zero means another worker already claimed it.
    async fn claim_queued(&self, id: Uuid) -> Result<u64, DatabaseError>;

    async fn mark_queued_sent(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Return a claimed item to PENDING with a new attempt count,
    /// backoff deadline, and error.
    async fn requeue_after_failure(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), DatabaseError>;

    /// Terminal failure once attempts are exhausted.
    async fn mark_queued_failed(
        &self,
        id: Uuid,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), DatabaseError>;

    /// Conditional cancel: PENDING → CANCELLED. Returns rows affected.
    async fn cancel_queued(&self, id: Uuid) -> Result<u64, DatabaseError>;

    async fn list_due_queued(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedEmail>, DatabaseError>;

    /// Re-arm PROCESSING rows older than the cutoff back to PENDING
    /// (crash-mid-claim recovery). Returns the number re-armed.
    async fn rearm_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Dead letters ────────────────────────────────────────────────

    async fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<(), DatabaseError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, DatabaseError>;
}
