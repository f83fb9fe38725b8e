//! Outbound mail transport — SMTP via lettre, behind a trait so the
//! dispatch path and tests can substitute a recording fake.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport as LettreSmtp, Transport};
use std::sync::Mutex;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::TransportError;

/// One email handed to the transport.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// RFC 5322 Message-ID to stamp on the outgoing mail; the join key
    /// replies correlate on.
    pub message_id_header: String,
}

/// Provider metadata reported back by the transport, backfilled onto the
/// outbound record when present.
#[derive(Debug, Clone, Default)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
}

/// The outbound transport seam.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError>;
}

// ── SMTP implementation ─────────────────────────────────────────────

/// SMTP transport over lettre.
pub struct SmtpMailTransport {
    config: SmtpConfig,
}

impl SmtpMailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Build and send synchronously (lettre's SMTP transport blocks).
    fn send_blocking(config: &SmtpConfig, email: &OutgoingEmail) -> Result<(), TransportError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let transport = LettreSmtp::relay(&config.host)
            .map_err(|e| TransportError::Send(format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();

        let message = Message::builder()
            .from(config.from_address.parse().map_err(|e| {
                TransportError::InvalidAddress {
                    address: config.from_address.clone(),
                    reason: format!("{e}"),
                }
            })?)
            .to(email.to.parse().map_err(|e| TransportError::InvalidAddress {
                address: email.to.clone(),
                reason: format!("{e}"),
            })?)
            .subject(&email.subject)
            .message_id(Some(email.message_id_header.clone()))
            .body(email.body.clone())
            .map_err(|e| TransportError::Build(format!("{e}")))?;

        transport
            .send(&message)
            .map(|_| ())
            .map_err(classify_smtp_error)?;

        info!(to = %email.to, "Email sent");
        Ok(())
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        let config = self.config.clone();
        let email = email.clone();
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &email))
            .await
            .map_err(|e| TransportError::Send(format!("send task panicked: {e}")))??;
        // SMTP reports no provider ids; they arrive later via sync.
        Ok(SendReceipt::default())
    }
}

/// Map an SMTP failure, routing rate-limit class rejections (421/450,
/// "too many") to `RateLimited` so the caller defers to the queue.
fn classify_smtp_error(e: lettre::transport::smtp::Error) -> TransportError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("421") || lower.contains("450") || lower.contains("too many") || lower.contains("rate limit") {
        TransportError::RateLimited
    } else {
        TransportError::Send(msg)
    }
}

// ── Recording fake ──────────────────────────────────────────────────

/// What the recording transport should do with the next send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    Deliver,
    RateLimit,
    Fail,
}

/// In-memory transport for tests: records every delivered email and can
/// simulate rate-limit and hard failures.
pub struct RecordingTransport {
    sent: Mutex<Vec<OutgoingEmail>>,
    mode: Mutex<RecordingMode>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            mode: Mutex::new(RecordingMode::Deliver),
        }
    }

    pub fn set_mode(&self, mode: RecordingMode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    /// Emails that reached the transport, in send order.
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<SendReceipt, TransportError> {
        match *self.mode.lock().expect("mode lock") {
            RecordingMode::Deliver => {
                self.sent.lock().expect("sent lock").push(email.clone());
                Ok(SendReceipt::default())
            }
            RecordingMode::RateLimit => Err(TransportError::RateLimited),
            RecordingMode::Fail => Err(TransportError::Send("simulated failure".into())),
        }
    }
}
