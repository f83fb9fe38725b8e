//! Reminder cadence state machine.
//!
//! One state row per (request, recipient) pair:
//! Unscheduled (no row) → Scheduled (`next_send_at` set) → Stopped
//! (`next_send_at` null, `stopped_reason` set). Stopped is terminal.
//!
//! Only GENUINE replies stop the cadence. A bounce flips the request to a
//! failure status yet the cadence keeps running — preserved observed
//! behavior, see DESIGN.md.
//!
//! Reminder *sending* is driven by an external scheduler that calls
//! `is_due`/`record_sent` per due state; no loop lives here.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::model::{Classification, ReminderState, Request, StopReason};
use crate::store::Store;

/// Manages reminder cadence state.
pub struct ReminderScheduler {
    store: Arc<dyn Store>,
    /// Hard ceiling on configured reminder counts.
    max_ceiling: u32,
}

impl ReminderScheduler {
    pub fn new(store: Arc<dyn Store>, max_ceiling: u32) -> Self {
        Self { store, max_ceiling }
    }

    /// The configured max, capped at the hard ceiling.
    fn effective_max(&self, request: &Request) -> u32 {
        request.reminder_config.max_count.min(self.max_ceiling)
    }

    /// Create the cadence state for a freshly dispatched request.
    ///
    /// No-op unless reminders are enabled and approved. Idempotent: an
    /// existing state row is returned unchanged rather than re-deriving
    /// `next_send_at`; a creation race resolves through the unique
    /// constraint plus re-fetch.
    pub async fn initialize(
        &self,
        request: &Request,
    ) -> Result<Option<ReminderState>, DatabaseError> {
        let config = &request.reminder_config;
        if !config.enabled || !config.approved {
            return Ok(None);
        }

        let recipient = request.recipient_email.as_str();
        if let Some(existing) = self
            .store
            .get_reminder_state(&request.id, recipient)
            .await?
        {
            return Ok(Some(existing));
        }

        // Durable copy of the config on the request, for audit/replay.
        let mut snapshot = config.clone();
        snapshot.max_count = self.effective_max(request);
        self.store
            .store_reminder_snapshot(&request.id, &snapshot)
            .await?;

        let now = Utc::now();
        let state = ReminderState {
            request_id: request.id.clone(),
            recipient: recipient.to_string(),
            reminder_number: 0,
            sent_count: 0,
            next_send_at: Some(now + Duration::hours(config.start_delay_hours)),
            last_sent_at: None,
            stopped_reason: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_reminder_state(&state).await {
            Ok(()) => {
                info!(
                    request_id = %request.id,
                    next_send_at = ?state.next_send_at,
                    "Reminder cadence scheduled"
                );
                Ok(Some(state))
            }
            Err(e) if e.is_unique_violation() => {
                // Lost a creation race — the winner's row is the state.
                debug!(request_id = %request.id, "Reminder init race, reusing existing state");
                self.store.get_reminder_state(&request.id, recipient).await
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the cadence on a classification outcome. Only GENUINE stops;
    /// BOUNCE and OUT_OF_OFFICE leave the cadence running. Returns
    /// whether a Scheduled → Stopped transition happened.
    pub async fn stop_on_classification(
        &self,
        request_id: &str,
        recipient: &str,
        classification: Classification,
    ) -> Result<bool, DatabaseError> {
        if classification != Classification::Genuine {
            return Ok(false);
        }

        let affected = self
            .store
            .stop_reminder(request_id, recipient, StopReason::Replied)
            .await?;
        if affected > 0 {
            info!(request_id, "Reminder cadence stopped: reply received");
        }
        Ok(affected > 0)
    }

    /// Whether a state row is due for a reminder send.
    pub fn is_due(state: &ReminderState, now: DateTime<Utc>) -> bool {
        match state.next_send_at {
            Some(next) => next <= now,
            None => false,
        }
    }

    /// Advance the cadence after the external scheduler sent a reminder:
    /// bump the count, recompute `next_send_at` for the next step, and
    /// stop at the configured maximum.
    pub async fn record_sent(
        &self,
        request: &Request,
        state: &ReminderState,
        now: DateTime<Utc>,
    ) -> Result<ReminderState, DatabaseError> {
        let new_count = state.sent_count + 1;
        let (next_send_at, stopped_reason) = if new_count >= self.effective_max(request) {
            (None, Some(StopReason::MaxSent))
        } else {
            (
                Some(now + Duration::hours(request.reminder_config.frequency_hours)),
                None,
            )
        };

        self.store
            .record_reminder_sent(
                &state.request_id,
                &state.recipient,
                now,
                next_send_at,
                stopped_reason,
            )
            .await?;

        self.store
            .get_reminder_state(&state.request_id, &state.recipient)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "reminder_state".into(),
                id: state.request_id.clone(),
            })
    }
}
