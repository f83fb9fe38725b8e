//! Dispatch guard — the idempotent outbound send path.
//!
//! Two layers of idempotency, both enforced at the data store:
//!
//! 1. Creation-time: the send-attempt ledger is unique per idempotency
//!    key. A duplicate create hits the constraint, is caught, and the
//!    existing row is re-fetched — never a fatal error.
//! 2. Dispatch-time: `sent_at` on the request is a compare-and-swap
//!    guard. The conditional write (`WHERE sent_at IS NULL`) decides the
//!    winner under concurrent duplicates; losers return the winner's
//!    persisted values without re-sending.
//!
//! A transport failure leaves the request un-sent (no partial state), so
//! the caller can retry safely. A rate-limited send is deferred to the
//! delivery queue instead of failing outright.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, Error};
use crate::model::{OutboundMessage, Request, SendOutcome};
use crate::queue::DeliveryQueue;
use crate::reminder::ReminderScheduler;
use crate::store::Store;
use crate::transport::{MailTransport, OutgoingEmail};

/// Idempotent outbound dispatcher.
pub struct DispatchGuard {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
    queue: Arc<DeliveryQueue>,
    reminders: Arc<ReminderScheduler>,
    mail_domain: String,
}

impl DispatchGuard {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn MailTransport>,
        queue: Arc<DeliveryQueue>,
        reminders: Arc<ReminderScheduler>,
        mail_domain: String,
    ) -> Self {
        Self {
            store,
            transport,
            queue,
            reminders,
            mail_domain,
        }
    }

    /// Perform one logical send. Under arbitrary concurrent duplicate
    /// calls the transport is invoked at most once per send action, and
    /// every caller observes the same `send_attempt_id`.
    pub async fn send(
        &self,
        request_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SendOutcome, Error> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| DispatchError::RequestNotFound(request_id.to_string()))?;

        if request.recipient_email.trim().is_empty() {
            return Err(DispatchError::NoRecipients(request_id.to_string()).into());
        }
        if request.subject.trim().is_empty() {
            return Err(DispatchError::NotReady {
                id: request_id.to_string(),
                reason: "empty subject".into(),
            }
            .into());
        }

        // Step 1 — creation-time idempotency via the attempt ledger.
        let attempt_id = self.resolve_attempt(request_id, idempotency_key).await?;

        // Step 2 — dispatch-time idempotency: never contact the transport
        // for a request that already carries a sent timestamp.
        if request.sent_at.is_some() {
            return Ok(SendOutcome {
                dispatched: false,
                already_sent: true,
                queued: false,
                send_attempt_id: request.send_attempt_id.unwrap_or(attempt_id),
                sent_at: request.sent_at,
            });
        }

        let message_id_header = format!("<{}@{}>", Uuid::new_v4(), self.mail_domain);
        let outgoing = OutgoingEmail {
            to: request.recipient_email.clone(),
            subject: request.subject.clone(),
            body: request.body.clone(),
            message_id_header: message_id_header.clone(),
        };

        let receipt = match self.transport.send(&outgoing).await {
            Ok(receipt) => receipt,
            Err(crate::error::TransportError::RateLimited) => {
                // Deferred, not failed: the queue retries after a
                // cool-down that outlives the rate-limit window.
                self.queue
                    .enqueue(&request.recipient_email, &request.subject, &request.body)
                    .await?;
                warn!(request_id, "Send rate limited — deferred to delivery queue");
                return Ok(SendOutcome {
                    dispatched: false,
                    already_sent: false,
                    queued: true,
                    send_attempt_id: attempt_id,
                    sent_at: None,
                });
            }
            Err(e) => {
                // The request stays un-sent; retry is safe.
                return Err(DispatchError::TransportFailed {
                    id: request_id.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
        };

        // The conditional write decides the winner; a loser must not
        // record a second outbound message or re-seed reminders.
        let sent_at = Utc::now();
        let affected = self
            .store
            .mark_request_sent(request_id, attempt_id, sent_at)
            .await?;

        if affected == 0 {
            let current = self
                .store
                .find_request(request_id)
                .await?
                .ok_or_else(|| DispatchError::RequestNotFound(request_id.to_string()))?;
            warn!(request_id, "Concurrent send lost the conditional write");
            return Ok(SendOutcome {
                dispatched: false,
                already_sent: true,
                queued: false,
                send_attempt_id: current.send_attempt_id.unwrap_or(attempt_id),
                sent_at: current.sent_at,
            });
        }

        self.store
            .insert_outbound(&OutboundMessage {
                id: Uuid::new_v4(),
                request_id: request_id.to_string(),
                recipient: request.recipient_email.clone(),
                subject: request.subject.clone(),
                body: request.body.clone(),
                provider_message_id: receipt.provider_message_id,
                provider_thread_id: receipt.provider_thread_id,
                message_id_header,
                sent_at,
            })
            .await?;

        self.seed_reminders(&request).await;

        info!(request_id, attempt_id = %attempt_id, "Request dispatched");
        Ok(SendOutcome {
            dispatched: true,
            already_sent: false,
            queued: false,
            send_attempt_id: attempt_id,
            sent_at: Some(sent_at),
        })
    }

    /// Find or create the ledger row for this send action.
    async fn resolve_attempt(
        &self,
        request_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Uuid, Error> {
        if let Some(key) = idempotency_key
            && let Some(existing) = self.store.find_send_attempt_by_key(key).await?
        {
            return Ok(existing.id);
        }

        let attempt_id = Uuid::new_v4();
        match self
            .store
            .insert_send_attempt(attempt_id, request_id, idempotency_key)
            .await
        {
            Ok(()) => Ok(attempt_id),
            Err(e) if e.is_unique_violation() => {
                // Two creations raced on the same key; the existing row
                // wins and this is not an error.
                let key = idempotency_key.unwrap_or_default();
                let existing = self
                    .store
                    .find_send_attempt_by_key(key)
                    .await?
                    .ok_or(e)?;
                Ok(existing.id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Seed the reminder cadence for a freshly dispatched request.
    /// Failures here never undo a completed send.
    async fn seed_reminders(&self, request: &Request) {
        if let Err(e) = self.reminders.initialize(request).await {
            warn!(request_id = %request.id, "Reminder initialization failed: {e}");
        }
    }
}
