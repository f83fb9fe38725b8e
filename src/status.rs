//! Status transition authority — applies a classification outcome to the
//! parent request.
//!
//! The rule set is deliberately conservative: a terminal outcome is never
//! downgraded, and auto-replies never move a conversation out of
//! "awaiting response".

use std::sync::Arc;
use tracing::debug;

use crate::error::DatabaseError;
use crate::model::{Classification, ReadStatus, RequestStatus};
use crate::store::Store;

/// Compute the status a classification maps to, or `None` when the
/// status must not change. Pure — the persisting wrapper below applies it.
///
/// Rules, in order: terminal statuses are immutable; BOUNCE → send
/// failed; GENUINE → replied; OUT_OF_OFFICE → unchanged (informational).
pub fn next_status(current: RequestStatus, classification: Classification) -> Option<RequestStatus> {
    if current.is_terminal() {
        return None;
    }
    match classification {
        Classification::Bounce => Some(RequestStatus::SendFailed),
        Classification::Genuine => Some(RequestStatus::Replied),
        Classification::OutOfOffice => None,
    }
}

/// The read marker recorded independently of the coarse status, for
/// UI/audit. Recorded even when the status itself is terminal.
pub fn read_marker(classification: Classification) -> Option<ReadStatus> {
    match classification {
        Classification::Bounce => Some(ReadStatus::Bounced),
        Classification::Genuine => Some(ReadStatus::Replied),
        Classification::OutOfOffice => None,
    }
}

/// Persisting wrapper around [`next_status`].
pub struct StatusAuthority {
    store: Arc<dyn Store>,
}

impl StatusAuthority {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply a classification to the request. Returns the new status, or
    /// `None` when it was left unchanged. Idempotent — replaying the same
    /// inbound message produces the same end state.
    pub async fn apply_classification(
        &self,
        request_id: &str,
        classification: Classification,
    ) -> Result<Option<RequestStatus>, DatabaseError> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "request".into(),
                id: request_id.into(),
            })?;

        if let Some(marker) = read_marker(classification) {
            self.store.set_request_read_status(request_id, marker).await?;
        }

        let Some(new_status) = next_status(request.status, classification) else {
            debug!(
                request_id,
                status = request.status.as_str(),
                classification = classification.as_str(),
                "Status unchanged"
            );
            return Ok(None);
        };

        self.store.update_request_status(request_id, new_status).await?;
        debug!(
            request_id,
            from = request.status.as_str(),
            to = new_status.as_str(),
            "Status transition applied"
        );
        Ok(Some(new_status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReminderConfig, Request};
    use crate::store::{LibSqlBackend, RequestStore};

    #[test]
    fn terminal_statuses_are_immutable() {
        for terminal in [RequestStatus::Complete, RequestStatus::Fulfilled] {
            assert_eq!(next_status(terminal, Classification::Bounce), None);
            assert_eq!(next_status(terminal, Classification::Genuine), None);
            assert_eq!(next_status(terminal, Classification::OutOfOffice), None);
        }
    }

    #[test]
    fn bounce_fails_the_request() {
        assert_eq!(
            next_status(RequestStatus::Sent, Classification::Bounce),
            Some(RequestStatus::SendFailed)
        );
    }

    #[test]
    fn genuine_marks_replied() {
        assert_eq!(
            next_status(RequestStatus::Sent, Classification::Genuine),
            Some(RequestStatus::Replied)
        );
    }

    #[test]
    fn out_of_office_changes_nothing() {
        assert_eq!(next_status(RequestStatus::Sent, Classification::OutOfOffice), None);
    }

    #[test]
    fn read_markers() {
        assert_eq!(read_marker(Classification::Bounce), Some(ReadStatus::Bounced));
        assert_eq!(read_marker(Classification::Genuine), Some(ReadStatus::Replied));
        assert_eq!(read_marker(Classification::OutOfOffice), None);
    }

    async fn seeded(status: RequestStatus) -> (StatusAuthority, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_request(&Request {
            id: "r1".into(),
            recipient_email: "vendor@example.com".into(),
            subject: "s".into(),
            body: "b".into(),
            status,
            read_status: None,
            sent_at: None,
            send_attempt_id: None,
            reminder_config: ReminderConfig::default(),
        })
        .await
        .unwrap();
        (StatusAuthority::new(db.clone()), db)
    }

    #[tokio::test]
    async fn terminal_request_keeps_status_but_records_marker() {
        let (authority, db) = seeded(RequestStatus::Complete).await;

        let changed = authority
            .apply_classification("r1", Classification::Bounce)
            .await
            .unwrap();
        assert_eq!(changed, None);

        let request = db.find_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Complete);
        assert_eq!(request.read_status, Some(ReadStatus::Bounced));
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let (authority, db) = seeded(RequestStatus::Sent).await;

        let first = authority
            .apply_classification("r1", Classification::Genuine)
            .await
            .unwrap();
        assert_eq!(first, Some(RequestStatus::Replied));

        // Replaying the same classification converges on the same state
        let second = authority
            .apply_classification("r1", Classification::Genuine)
            .await
            .unwrap();
        assert_eq!(second, Some(RequestStatus::Replied));

        let request = db.find_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Replied);
        assert_eq!(request.read_status, Some(ReadStatus::Replied));
    }
}
