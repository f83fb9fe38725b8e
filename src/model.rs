//! Domain types shared across the engine.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Classification ──────────────────────────────────────────────────

/// Outcome of classifying an inbound email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Delivery-failure notification from mail infrastructure.
    Bounce,
    /// Automated reply (out-of-office, auto-responder).
    OutOfOffice,
    /// A substantive human reply.
    Genuine,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Bounce => "bounce",
            Classification::OutOfOffice => "out_of_office",
            Classification::Genuine => "genuine",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bounce" => Classification::Bounce,
            "out_of_office" => Classification::OutOfOffice,
            _ => Classification::Genuine,
        }
    }
}

// ── Request (parent entity, narrow view) ────────────────────────────

/// Status of the parent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Not yet dispatched.
    Draft,
    /// Dispatched, awaiting a response.
    Sent,
    /// A genuine reply arrived.
    Replied,
    /// Delivery bounced.
    SendFailed,
    /// Terminal: the request was satisfied.
    Complete,
    /// Terminal: the request was fulfilled out of band.
    Fulfilled,
}

impl RequestStatus {
    /// Terminal statuses are never overwritten by classification outcomes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Complete | RequestStatus::Fulfilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::Sent => "sent",
            RequestStatus::Replied => "replied",
            RequestStatus::SendFailed => "send_failed",
            RequestStatus::Complete => "complete",
            RequestStatus::Fulfilled => "fulfilled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => RequestStatus::Sent,
            "replied" => RequestStatus::Replied,
            "send_failed" => RequestStatus::SendFailed,
            "complete" => RequestStatus::Complete,
            "fulfilled" => RequestStatus::Fulfilled,
            _ => RequestStatus::Draft,
        }
    }
}

/// Coarse read marker recorded independently of `RequestStatus`, for
/// UI/audit. A terminal request still gets its marker updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    Replied,
    Bounced,
}

impl ReadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Replied => "replied",
            ReadStatus::Bounced => "bounced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replied" => Some(ReadStatus::Replied),
            "bounced" => Some(ReadStatus::Bounced),
            _ => None,
        }
    }
}

/// Durable copy of the reminder configuration, snapshotted onto the
/// request at initialization for audit/replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderConfig {
    pub enabled: bool,
    pub approved: bool,
    pub start_delay_hours: i64,
    pub frequency_hours: i64,
    pub max_count: u32,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            approved: false,
            start_delay_hours: 72,
            frequency_hours: 72,
            max_count: 3,
        }
    }
}

/// Narrow view of the parent request entity. Mailflow owns only the
/// dispatch guard fields (`sent_at`, `send_attempt_id`), the status pair,
/// and the reminder-config snapshot; everything else lives elsewhere.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub recipient_email: String,
    pub subject: String,
    pub body: String,
    pub status: RequestStatus,
    pub read_status: Option<ReadStatus>,
    pub sent_at: Option<DateTime<Utc>>,
    pub send_attempt_id: Option<Uuid>,
    pub reminder_config: ReminderConfig,
}

// ── Messages ────────────────────────────────────────────────────────

/// An outbound email as persisted at dispatch time. Immutable once
/// created except for provider metadata backfill.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub request_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
    /// RFC 5322 Message-ID of the sent mail — the primary correlation key.
    pub message_id_header: String,
    pub sent_at: DateTime<Utc>,
}

/// Reference to a stored attachment (blob already uploaded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub url: String,
    pub content_type: String,
}

/// An inbound email as persisted after ingestion.
#[derive(Debug, Clone)]
pub struct StoredInbound {
    pub id: Uuid,
    pub request_id: Option<String>,
    pub sender: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub provider_message_id: String,
    pub provider: String,
    pub provider_thread_id: Option<String>,
    pub is_auto_reply: bool,
    pub classification: Classification,
    pub attachment_refs: Vec<AttachmentRef>,
    pub received_at: DateTime<Utc>,
}

// ── Ingestion entry shape ───────────────────────────────────────────

/// Typed provider fields the correlator needs, extracted at the
/// ingestion boundary. The rest of the provider payload rides along as
/// an opaque blob for audit and is never parsed downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderData {
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub thread_id: Option<String>,
    pub message_id_header: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// Transport headers that signal automation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationHeaders {
    pub auto_submitted: Option<String>,
    pub x_auto_response_suppress: Option<String>,
    pub precedence: Option<String>,
}

/// Raw attachment bytes as received from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundAttachment {
    pub filename: String,
    #[serde(with = "serde_bytes_b64")]
    pub content: Vec<u8>,
    pub content_type: String,
}

/// The single normalized inbound shape consumed by the ingestion entry
/// point, from webhooks and the sync cursor manager alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedInbound {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    pub provider_message_id: String,
    pub provider_data: ProviderData,
    #[serde(default)]
    pub headers: AutomationHeaders,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
}

/// Base64 (de)serialization for attachment bytes in JSON payloads.
mod serde_bytes_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// ── Reminders ───────────────────────────────────────────────────────

/// Why a reminder cadence stopped. Present iff `next_send_at` is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A genuine reply arrived.
    Replied,
    /// The configured maximum number of reminders was sent.
    MaxSent,
    /// Stopped by explicit user action.
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Replied => "replied",
            StopReason::MaxSent => "max_sent",
            StopReason::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replied" => Some(StopReason::Replied),
            "max_sent" => Some(StopReason::MaxSent),
            "cancelled" => Some(StopReason::Cancelled),
            _ => None,
        }
    }
}

/// Reminder cadence state for one (request, recipient) pair.
#[derive(Debug, Clone)]
pub struct ReminderState {
    pub request_id: String,
    pub recipient: String,
    pub reminder_number: u32,
    pub sent_count: u32,
    /// `None` is the terminal "stopped" state.
    pub next_send_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub stopped_reason: Option<StopReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReminderState {
    pub fn is_stopped(&self) -> bool {
        self.stopped_reason.is_some()
    }
}

// ── Connected accounts ──────────────────────────────────────────────

/// Mail providers with a sync adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gmail" => Some(Provider::Gmail),
            "outlook" => Some(Provider::Outlook),
            _ => None,
        }
    }
}

/// OAuth credentials for a connected account. Token values are secrets
/// and never appear in logs or Debug output; `Serialize` is implemented
/// by hand because it exists solely for the encrypted credentials column.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountCredentials {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
}

impl Serialize for AccountCredentials {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use secrecy::ExposeSecret;
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("AccountCredentials", 2)?;
        st.serialize_field("access_token", self.access_token.expose_secret())?;
        st.serialize_field("refresh_token", self.refresh_token.expose_secret())?;
        st.end()
    }
}

/// A mailbox connected for sync. `is_active = false` is a terminal
/// failure state requiring manual reconnection.
#[derive(Debug, Clone)]
pub struct ConnectedAccount {
    pub id: Uuid,
    pub provider: Provider,
    pub email: String,
    pub credentials: AccountCredentials,
    pub is_active: bool,
    /// Per-provider opaque cursor map; merged, never overwritten.
    pub sync_cursor: BTreeMap<String, String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

// ── Delivery queue ──────────────────────────────────────────────────

/// Lifecycle of a queued email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => QueueStatus::Processing,
            "sent" => QueueStatus::Sent,
            "failed" => QueueStatus::Failed,
            "cancelled" => QueueStatus::Cancelled,
            _ => QueueStatus::Pending,
        }
    }
}

/// A deferred send held in the bounded-retry delivery queue.
#[derive(Debug, Clone)]
pub struct QueuedEmail {
    pub id: Uuid,
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Outcomes / reports ──────────────────────────────────────────────

/// Result of a dispatch guard `send` call. All callers — winner and
/// losers of a duplicate race alike — observe the same attempt id.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    /// Whether this call performed the transport send.
    pub dispatched: bool,
    /// Whether the request had already been sent before this call.
    pub already_sent: bool,
    /// Whether the send was deferred to the delivery queue (rate limit).
    pub queued: bool,
    pub send_attempt_id: Uuid,
    pub sent_at: Option<DateTime<Utc>>,
}

/// What happened to one ingested inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestDisposition {
    /// Correlated and persisted.
    Processed,
    /// Already recorded for this (provider message id, provider) pair.
    Duplicate,
    /// No correlation strategy matched; retained for manual triage.
    DeadLettered,
}

/// Result of the ingestion entry point.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub message_id: Option<Uuid>,
    pub request_id: Option<String>,
    pub disposition: IngestDisposition,
}

/// Aggregate counters for one sync pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncReport {
    pub accounts_synced: u32,
    pub accounts_failed: u32,
    pub fetched: u32,
    pub persisted: u32,
    pub duplicates: u32,
    pub orphans: u32,
}

/// One provider fetch page.
#[derive(Debug, Clone)]
pub struct FetchPage {
    pub messages: Vec<NormalizedInbound>,
    pub next_cursor: Option<String>,
    /// True when a null cursor triggered the bounded look-back bootstrap.
    pub bootstrap_performed: bool,
}
