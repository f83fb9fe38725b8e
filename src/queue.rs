//! Bounded-retry delivery queue for deferred and rate-limited sends.
//!
//! State machine: PENDING → PROCESSING → {SENT | PENDING (retry) |
//! FAILED}. PENDING may also transition to CANCELLED on explicit user
//! action. The claim is a conditional update; a worker that loses the
//! claim must not process the item.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{DatabaseError, TransportError};
use crate::model::{QueueStatus, QueuedEmail};
use crate::store::Store;
use crate::transport::{MailTransport, OutgoingEmail};

/// Delivery queue over the persistent store.
pub struct DeliveryQueue {
    store: Arc<dyn Store>,
    config: QueueConfig,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Enqueue a deferred send. The first attempt is scheduled a full
    /// cool-down out, so it lands past the transport's rate-limit window.
    pub async fn enqueue(
        &self,
        to_email: &str,
        subject: &str,
        body: &str,
    ) -> Result<QueuedEmail, DatabaseError> {
        let now = Utc::now();
        let email = QueuedEmail {
            id: uuid::Uuid::new_v4(),
            to_email: to_email.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            next_attempt_at: now + ChronoDuration::from_std(self.config.base_delay).unwrap_or_default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.enqueue_email(&email).await?;
        info!(id = %email.id, to = %email.to_email, "Email queued for deferred delivery");
        Ok(email)
    }

    /// Claim an item for processing. Returns false when another worker
    /// already holds it.
    pub async fn claim(&self, id: uuid::Uuid) -> Result<bool, DatabaseError> {
        Ok(self.store.claim_queued(id).await? > 0)
    }

    /// Terminal success.
    pub async fn mark_sent(&self, id: uuid::Uuid) -> Result<(), DatabaseError> {
        self.store.mark_queued_sent(id).await
    }

    /// Record a failed attempt: terminal FAILED once attempts are
    /// exhausted, otherwise back to PENDING with exponential backoff
    /// (`base_delay * 2^attempts`, no jitter).
    pub async fn mark_failed(
        &self,
        email: &QueuedEmail,
        error: &str,
    ) -> Result<QueueStatus, DatabaseError> {
        let attempts = email.attempts + 1;
        if attempts >= email.max_attempts {
            self.store.mark_queued_failed(email.id, attempts, error).await?;
            warn!(id = %email.id, attempts, "Queued email failed terminally");
            return Ok(QueueStatus::Failed);
        }

        let backoff = self.config.base_delay * 2u32.saturating_pow(attempts);
        let next_attempt_at = Utc::now() + ChronoDuration::from_std(backoff).unwrap_or_default();
        self.store
            .requeue_after_failure(email.id, attempts, next_attempt_at, error)
            .await?;
        debug!(id = %email.id, attempts, backoff_secs = backoff.as_secs(), "Queued email re-armed with backoff");
        Ok(QueueStatus::Pending)
    }

    /// Explicit user cancellation. Only PENDING items can be cancelled.
    pub async fn cancel(&self, id: uuid::Uuid) -> Result<bool, DatabaseError> {
        Ok(self.store.cancel_queued(id).await? > 0)
    }

    /// Re-arm PROCESSING rows abandoned by a crashed worker.
    pub async fn recover_stale_claims(&self) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.stale_claim_after).unwrap_or_default();
        self.store.rearm_stale_processing(cutoff).await
    }

    /// Process every due PENDING item once: claim, send, settle.
    pub async fn process_due(
        &self,
        transport: &dyn MailTransport,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let due = self.store.list_due_queued(now, 20).await?;
        let mut processed = 0;

        for email in due {
            if !self.claim(email.id).await? {
                // Another worker won the claim.
                continue;
            }

            let outgoing = OutgoingEmail {
                to: email.to_email.clone(),
                subject: email.subject.clone(),
                body: email.body.clone(),
                message_id_header: format!("<{}@queue.mailflow>", email.id),
            };

            match transport.send(&outgoing).await {
                Ok(_) => {
                    self.mark_sent(email.id).await?;
                    processed += 1;
                }
                Err(TransportError::RateLimited) => {
                    self.mark_failed(&email, "rate limited").await?;
                }
                Err(e) => {
                    self.mark_failed(&email, &e.to_string()).await?;
                }
            }
        }

        Ok(processed)
    }
}

/// Spawn the queue worker: recovers stale claims once, then drives
/// `process_due` on an interval until the shutdown flag is set.
pub fn spawn_queue_worker(
    queue: Arc<DeliveryQueue>,
    transport: Arc<dyn MailTransport>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let poll_interval = queue.config.poll_interval;

    let handle = tokio::spawn(async move {
        info!(
            "Delivery queue worker started — scanning every {}s",
            poll_interval.as_secs()
        );

        if let Err(e) = queue.recover_stale_claims().await {
            error!("Stale claim recovery failed: {e}");
        }

        let mut tick = tokio::time::interval(Duration::from_secs(poll_interval.as_secs().max(1)));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Delivery queue worker shutting down");
                return;
            }

            match queue.process_due(transport.as_ref(), Utc::now()).await {
                Ok(0) => {}
                Ok(n) => debug!(sent = n, "Delivery queue pass complete"),
                Err(e) => error!("Delivery queue pass failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::transport::{RecordingMode, RecordingTransport};

    async fn queue_with(config: QueueConfig) -> (DeliveryQueue, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (DeliveryQueue::new(db.clone(), config), db)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            base_delay: Duration::from_secs(300),
            max_attempts: 3,
            poll_interval: Duration::from_secs(60),
            stale_claim_after: Duration::from_secs(900),
        }
    }

    #[tokio::test]
    async fn enqueue_applies_cooldown() {
        let (queue, _db) = queue_with(fast_config()).await;
        let before = Utc::now();
        let email = queue.enqueue("vendor@example.com", "s", "b").await.unwrap();
        assert_eq!(email.status, QueueStatus::Pending);
        assert!(email.next_attempt_at >= before + ChronoDuration::seconds(299));
    }

    #[tokio::test]
    async fn backoff_grows_until_terminal_failure() {
        let (queue, db) = queue_with(fast_config()).await;
        let email = queue.enqueue("vendor@example.com", "s", "b").await.unwrap();

        // Failures 1..max-1 return to PENDING with strictly increasing deadlines
        let mut last_deadline = email.next_attempt_at;
        let mut current = email;
        for attempt in 1..fast_config().max_attempts {
            let status = queue.mark_failed(&current, "boom").await.unwrap();
            current = db.get_queued(current.id).await.unwrap().unwrap();
            assert_eq!(status, QueueStatus::Pending, "attempt {attempt}");
            assert_eq!(current.attempts, attempt);
            assert!(
                current.next_attempt_at > last_deadline,
                "deadline must grow on attempt {attempt}"
            );
            assert_eq!(current.last_error.as_deref(), Some("boom"));
            last_deadline = current.next_attempt_at;
        }

        // The max_attempts-th failure is terminal
        let status = queue.mark_failed(&current, "boom").await.unwrap();
        assert_eq!(status, QueueStatus::Failed);
        let stored = db.get_queued(current.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.attempts, fast_config().max_attempts);
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let (queue, _db) = queue_with(fast_config()).await;
        let email = queue.enqueue("vendor@example.com", "s", "b").await.unwrap();

        assert!(queue.cancel(email.id).await.unwrap());
        // Already cancelled — second cancel is a no-op
        assert!(!queue.cancel(email.id).await.unwrap());
    }

    #[tokio::test]
    async fn process_due_sends_and_settles() {
        let mut config = fast_config();
        config.base_delay = Duration::from_secs(0);
        let (queue, db) = queue_with(config).await;
        let email = queue.enqueue("vendor@example.com", "s", "b").await.unwrap();

        let transport = RecordingTransport::new();
        let sent = queue.process_due(&transport, Utc::now()).await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(transport.sent_count(), 1);

        let stored = db.get_queued(email.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Sent);

        // A settled item is not picked up again
        let again = queue.process_due(&transport, Utc::now()).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn process_due_requeues_on_rate_limit() {
        let mut config = fast_config();
        config.base_delay = Duration::from_secs(0);
        let (queue, db) = queue_with(config).await;
        let email = queue.enqueue("vendor@example.com", "s", "b").await.unwrap();

        let transport = RecordingTransport::new();
        transport.set_mode(RecordingMode::RateLimit);
        let sent = queue.process_due(&transport, Utc::now()).await.unwrap();
        assert_eq!(sent, 0);

        let stored = db.get_queued(email.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn not_due_items_are_left_alone() {
        let (queue, _db) = queue_with(fast_config()).await;
        queue.enqueue("vendor@example.com", "s", "b").await.unwrap();

        // Cooldown is 5 minutes; nothing is due right now
        let transport = RecordingTransport::new();
        let sent = queue.process_due(&transport, Utc::now()).await.unwrap();
        assert_eq!(sent, 0);
        assert_eq!(transport.sent_count(), 0);
    }
}
