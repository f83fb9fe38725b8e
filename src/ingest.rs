//! The single ingestion entry point for inbound mail.
//!
//! Push webhooks and the sync cursor manager both feed the same path:
//! dedup guard → classify → correlate → status transition → reminder
//! stop → persist → background events. Every mutating step is idempotent
//! so replaying a message (crash mid-processing, webhook retry, poll
//! overlap) converges on the same end state.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{ClassifyInput, classify};
use crate::correlate::{Correlator, hash_identity};
use crate::error::{Error, IngestError};
use crate::model::{
    AttachmentRef, Classification, IngestDisposition, IngestOutcome, NormalizedInbound,
    StoredInbound,
};
use crate::reminder::ReminderScheduler;
use crate::status::StatusAuthority;
use crate::store::{DeadLetter, Store};

// ── Collaborator seams ──────────────────────────────────────────────

/// Attachment blob storage, owned elsewhere.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        bytes: &[u8],
        key: &str,
        mime_type: &str,
    ) -> Result<String, IngestError>;

    async fn get_url(&self, key: &str) -> Result<String, IngestError>;

    async fn delete(&self, key: &str) -> Result<(), IngestError>;
}

/// Fire-and-forget events for downstream workers. The engine only emits
/// these; it never awaits their completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundEvent {
    /// Verify and scan stored attachments of an inbound message.
    AttachmentScan { message_id: Uuid },
    /// Summarize a genuine reply for the request timeline.
    Summarize { message_id: Uuid, request_id: String },
}

pub trait JobDispatcher: Send + Sync {
    fn dispatch(&self, event: BackgroundEvent);
}

/// Blob store that never leaves process memory. Useful for tests and
/// single-node deployments without object storage.
#[derive(Default)]
pub struct MemoryBlobStore {
    uploads: std::sync::Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        self.uploads.lock().expect("uploads lock").clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        _bytes: &[u8],
        key: &str,
        _mime_type: &str,
    ) -> Result<String, IngestError> {
        self.uploads
            .lock()
            .expect("uploads lock")
            .push(key.to_string());
        Ok(format!("memory://{key}"))
    }

    async fn get_url(&self, key: &str) -> Result<String, IngestError> {
        Ok(format!("memory://{key}"))
    }

    async fn delete(&self, _key: &str) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Dispatcher that only logs. Deployments wire a real job runner here.
pub struct LogJobDispatcher;

impl JobDispatcher for LogJobDispatcher {
    fn dispatch(&self, event: BackgroundEvent) {
        debug!(?event, "Background event emitted");
    }
}

// ── Ingestor ────────────────────────────────────────────────────────

/// Drives one inbound message through the full reception pipeline.
pub struct Ingestor {
    store: Arc<dyn Store>,
    correlator: Correlator,
    authority: StatusAuthority,
    reminders: Arc<ReminderScheduler>,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobDispatcher>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        reminders: Arc<ReminderScheduler>,
        blobs: Arc<dyn BlobStore>,
        jobs: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            correlator: Correlator::new(store.clone()),
            authority: StatusAuthority::new(store.clone()),
            store,
            reminders,
            blobs,
            jobs,
        }
    }

    /// Ingest one normalized inbound message.
    pub async fn ingest(&self, inbound: NormalizedInbound) -> Result<IngestOutcome, Error> {
        let provider = inbound.provider_data.provider.clone();

        // Dedup guard against webhook/poll double-delivery and
        // overlapping fetch windows.
        if self
            .store
            .inbound_exists(&inbound.provider_message_id, &provider)
            .await?
        {
            debug!(
                provider_message_id = %inbound.provider_message_id,
                provider = %provider,
                "Duplicate inbound skipped"
            );
            return Ok(IngestOutcome {
                message_id: None,
                request_id: None,
                disposition: IngestDisposition::Duplicate,
            });
        }

        let classification = classify(&ClassifyInput {
            from: &inbound.from,
            subject: inbound.subject.as_deref().unwrap_or(""),
            body: inbound.body.as_deref().unwrap_or(""),
            headers: &inbound.headers,
        });

        let Some(request_id) = self.correlator.correlate(&inbound).await? else {
            // Orphan — retained for manual triage, never silently dropped.
            self.store
                .insert_dead_letter(&DeadLetter {
                    id: Uuid::new_v4(),
                    provider_message_id: inbound.provider_message_id.clone(),
                    provider,
                    sender_hash: hash_identity(&inbound.from),
                    subject: inbound.subject.clone(),
                    reason: "no correlation strategy matched".into(),
                    payload: inbound.provider_data.raw.clone(),
                })
                .await?;
            return Ok(IngestOutcome {
                message_id: None,
                request_id: None,
                disposition: IngestDisposition::DeadLettered,
            });
        };

        self.authority
            .apply_classification(&request_id, classification)
            .await?;
        self.reminders
            .stop_on_classification(&request_id, &inbound.from, classification)
            .await?;

        let attachment_refs = self.store_attachments(&inbound).await?;

        let message_id = Uuid::new_v4();
        let stored = StoredInbound {
            id: message_id,
            request_id: Some(request_id.clone()),
            sender: inbound.from.clone(),
            subject: inbound.subject.clone(),
            body: inbound.body.clone(),
            html_body: inbound.html_body.clone(),
            provider_message_id: inbound.provider_message_id.clone(),
            provider: inbound.provider_data.provider.clone(),
            provider_thread_id: inbound.provider_data.thread_id.clone(),
            is_auto_reply: classification == Classification::OutOfOffice,
            classification,
            attachment_refs: attachment_refs.clone(),
            received_at: Utc::now(),
        };

        match self.store.insert_inbound(&stored).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                // A concurrent ingestion won between our dedup check and
                // this insert. Everything upstream was idempotent.
                debug!(
                    provider_message_id = %inbound.provider_message_id,
                    "Lost inbound insert race — treating as duplicate"
                );
                return Ok(IngestOutcome {
                    message_id: None,
                    request_id: Some(request_id),
                    disposition: IngestDisposition::Duplicate,
                });
            }
            Err(e) => return Err(e.into()),
        }

        if !attachment_refs.is_empty() {
            self.jobs.dispatch(BackgroundEvent::AttachmentScan { message_id });
        }
        if classification == Classification::Genuine {
            self.jobs.dispatch(BackgroundEvent::Summarize {
                message_id,
                request_id: request_id.clone(),
            });
        }

        info!(
            request_id = %request_id,
            sender_hash = %hash_identity(&inbound.from),
            classification = classification.as_str(),
            "Inbound message ingested"
        );
        Ok(IngestOutcome {
            message_id: Some(message_id),
            request_id: Some(request_id),
            disposition: IngestDisposition::Processed,
        })
    }

    /// Upload attachments and build their references. A single failed
    /// upload fails the message (the caller's batch loop logs and moves
    /// on); already-uploaded blobs stay, keyed by provider message id, so
    /// a replay overwrites rather than duplicates.
    async fn store_attachments(
        &self,
        inbound: &NormalizedInbound,
    ) -> Result<Vec<AttachmentRef>, Error> {
        let mut refs = Vec::with_capacity(inbound.attachments.len());
        for (index, attachment) in inbound.attachments.iter().enumerate() {
            let key = format!(
                "inbound/{}/{}/{}-{}",
                inbound.provider_data.provider,
                inbound.provider_message_id,
                index,
                attachment.filename
            );
            let url = self
                .blobs
                .upload(&attachment.content, &key, &attachment.content_type)
                .await
                .map_err(|e| {
                    warn!(filename = %attachment.filename, "Attachment upload failed: {e}");
                    IngestError::AttachmentStorage {
                        filename: attachment.filename.clone(),
                        reason: e.to_string(),
                    }
                })?;
            refs.push(AttachmentRef {
                filename: attachment.filename.clone(),
                url,
                content_type: attachment.content_type.clone(),
            });
        }
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        InboundAttachment, OutboundMessage, ProviderData, ReadStatus, ReminderConfig, Request,
        RequestStatus,
    };
    use crate::store::{LibSqlBackend, RequestStore, Store as _};
    use std::sync::Mutex;

    struct RecordingJobs {
        events: Mutex<Vec<BackgroundEvent>>,
    }

    impl RecordingJobs {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<BackgroundEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl JobDispatcher for RecordingJobs {
        fn dispatch(&self, event: BackgroundEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        ingestor: Ingestor,
        db: Arc<LibSqlBackend>,
        jobs: Arc<RecordingJobs>,
        blobs: Arc<MemoryBlobStore>,
    }

    async fn harness() -> Harness {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let jobs = Arc::new(RecordingJobs::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let reminders = Arc::new(ReminderScheduler::new(db.clone(), 10));
        let ingestor = Ingestor::new(db.clone(), reminders, blobs.clone(), jobs.clone());
        Harness {
            ingestor,
            db,
            jobs,
            blobs,
        }
    }

    async fn seed_sent_request(db: &LibSqlBackend, id: &str, status: RequestStatus) {
        db.insert_request(&Request {
            id: id.into(),
            recipient_email: "vendor@example.com".into(),
            subject: "Please send your W-9".into(),
            body: "b".into(),
            status,
            read_status: None,
            sent_at: Some(Utc::now()),
            send_attempt_id: None,
            reminder_config: ReminderConfig {
                enabled: true,
                approved: true,
                start_delay_hours: 48,
                frequency_hours: 72,
                max_count: 3,
            },
        })
        .await
        .unwrap();

        db.insert_outbound(&OutboundMessage {
            id: Uuid::new_v4(),
            request_id: id.into(),
            recipient: "vendor@example.com".into(),
            subject: "Please send your W-9".into(),
            body: "b".into(),
            provider_message_id: None,
            provider_thread_id: Some(format!("thread-{id}")),
            message_id_header: format!("<out-{id}@mail.example>"),
            sent_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    fn reply(request_id: &str, provider_message_id: &str) -> NormalizedInbound {
        NormalizedInbound {
            from: "vendor@example.com".into(),
            to: "inbox@mail.example".into(),
            reply_to: None,
            subject: Some("Re: Please send your W-9".into()),
            body: Some("Attached is the signed form.".into()),
            html_body: None,
            provider_message_id: provider_message_id.into(),
            provider_data: ProviderData {
                in_reply_to: Some(format!("<out-{request_id}@mail.example>")),
                references: None,
                thread_id: None,
                message_id_header: None,
                provider: "gmail".into(),
                raw: None,
            },
            headers: Default::default(),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn genuine_reply_full_pipeline() {
        let h = harness().await;
        seed_sent_request(&h.db, "r1", RequestStatus::Sent).await;

        // Seed the reminder cadence as dispatch would have
        let request = h.db.find_request("r1").await.unwrap().unwrap();
        ReminderScheduler::new(h.db.clone(), 10)
            .initialize(&request)
            .await
            .unwrap();

        let outcome = h.ingestor.ingest(reply("r1", "pm-1")).await.unwrap();
        assert_eq!(outcome.disposition, IngestDisposition::Processed);
        assert_eq!(outcome.request_id.as_deref(), Some("r1"));

        let request = h.db.find_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Replied);
        assert_eq!(request.read_status, Some(ReadStatus::Replied));

        let state = h
            .db
            .get_reminder_state("r1", "vendor@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(state.next_send_at.is_none(), "genuine reply stops reminders");

        let events = h.jobs.events();
        assert!(events.iter().any(|e| matches!(e, BackgroundEvent::Summarize { .. })));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_noop_skip() {
        let h = harness().await;
        seed_sent_request(&h.db, "r1", RequestStatus::Sent).await;

        let first = h.ingestor.ingest(reply("r1", "pm-1")).await.unwrap();
        assert_eq!(first.disposition, IngestDisposition::Processed);

        let second = h.ingestor.ingest(reply("r1", "pm-1")).await.unwrap();
        assert_eq!(second.disposition, IngestDisposition::Duplicate);

        let stored = h.db.list_inbound_for_request("r1").await.unwrap();
        assert_eq!(stored.len(), 1, "exactly one row per provider message id");
    }

    #[tokio::test]
    async fn bounce_flips_status_but_not_terminal_requests() {
        let h = harness().await;
        seed_sent_request(&h.db, "r1", RequestStatus::Sent).await;

        let mut bounce = reply("r1", "pm-bounce");
        bounce.from = "mailer-daemon@example.com".into();
        bounce.subject = Some("Undeliverable: Q3 Invoice".into());
        bounce.body = Some("550 mailbox not found".into());

        h.ingestor.ingest(bounce).await.unwrap();

        let request = h.db.find_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::SendFailed);
        assert_eq!(request.read_status, Some(ReadStatus::Bounced));

        // A terminal request keeps its status under the same bounce
        seed_sent_request(&h.db, "r2", RequestStatus::Complete).await;
        let mut bounce = reply("r2", "pm-bounce-2");
        bounce.from = "mailer-daemon@example.com".into();
        bounce.subject = Some("Undeliverable: Q3 Invoice".into());
        bounce.body = Some("550 mailbox not found".into());
        h.ingestor.ingest(bounce).await.unwrap();

        let request = h.db.find_request("r2").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Complete);
    }

    #[tokio::test]
    async fn out_of_office_changes_nothing() {
        let h = harness().await;
        seed_sent_request(&h.db, "r1", RequestStatus::Sent).await;
        let request = h.db.find_request("r1").await.unwrap().unwrap();
        ReminderScheduler::new(h.db.clone(), 10)
            .initialize(&request)
            .await
            .unwrap();

        let mut ooo = reply("r1", "pm-ooo");
        ooo.body = Some("I'm currently out of the office until Monday".into());

        let outcome = h.ingestor.ingest(ooo).await.unwrap();
        assert_eq!(outcome.disposition, IngestDisposition::Processed);

        let request = h.db.find_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Sent, "status unchanged");

        let state = h
            .db
            .get_reminder_state("r1", "vendor@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(state.next_send_at.is_some(), "cadence unchanged");

        let stored = h.db.list_inbound_for_request("r1").await.unwrap();
        assert!(stored[0].is_auto_reply);
    }

    #[tokio::test]
    async fn orphan_is_dead_lettered() {
        let h = harness().await;

        let mut orphan = reply("ghost", "pm-orphan");
        orphan.subject = Some("Re: abc".into()); // too short for the heuristic
        let outcome = h.ingestor.ingest(orphan).await.unwrap();
        assert_eq!(outcome.disposition, IngestDisposition::DeadLettered);
        assert_eq!(outcome.request_id, None);

        let letters = h.db.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].provider_message_id, "pm-orphan");
        // Hashed, never the raw address
        assert!(!letters[0].sender_hash.contains('@'));
    }

    #[tokio::test]
    async fn attachments_are_uploaded_and_referenced() {
        let h = harness().await;
        seed_sent_request(&h.db, "r1", RequestStatus::Sent).await;

        let mut msg = reply("r1", "pm-att");
        msg.attachments = vec![InboundAttachment {
            filename: "w9.pdf".into(),
            content: vec![0x25, 0x50, 0x44, 0x46],
            content_type: "application/pdf".into(),
        }];

        h.ingestor.ingest(msg).await.unwrap();

        assert_eq!(h.blobs.uploaded_keys().len(), 1);
        let stored = h.db.list_inbound_for_request("r1").await.unwrap();
        assert_eq!(stored[0].attachment_refs.len(), 1);
        assert_eq!(stored[0].attachment_refs[0].filename, "w9.pdf");
        assert!(stored[0].attachment_refs[0].url.starts_with("memory://"));

        let events = h.jobs.events();
        assert!(events.iter().any(|e| matches!(e, BackgroundEvent::AttachmentScan { .. })));
    }

    #[tokio::test]
    async fn replaying_after_partial_processing_converges() {
        let h = harness().await;
        seed_sent_request(&h.db, "r1", RequestStatus::Sent).await;

        // First pass lands everything
        h.ingestor.ingest(reply("r1", "pm-1")).await.unwrap();
        // Replay of the same message (webhook retry) is a duplicate skip
        // and leaves status untouched
        h.ingestor.ingest(reply("r1", "pm-1")).await.unwrap();

        let request = h.db.find_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Replied);
        let stored = h.db.list_inbound_for_request("r1").await.unwrap();
        assert_eq!(stored.len(), 1);
    }
}
