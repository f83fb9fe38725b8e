//! End-to-end reception scenarios: dispatch a request, feed replies in
//! through the webhook normalization path, and observe status, reminder,
//! and dedup effects.

use std::sync::Arc;

use mailflow::config::QueueConfig;
use mailflow::dispatch::DispatchGuard;
use mailflow::ingest::{Ingestor, LogJobDispatcher, MemoryBlobStore};
use mailflow::model::{
    IngestDisposition, ReadStatus, ReminderConfig, Request, RequestStatus,
};
use mailflow::queue::DeliveryQueue;
use mailflow::reminder::ReminderScheduler;
use mailflow::routes::mime_to_inbound;
use mailflow::store::{LibSqlBackend, RequestStore, Store};
use mailflow::transport::RecordingTransport;

struct World {
    store: Arc<LibSqlBackend>,
    guard: DispatchGuard,
    ingestor: Ingestor,
    transport: Arc<RecordingTransport>,
}

async fn world() -> World {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport = Arc::new(RecordingTransport::new());
    let queue = Arc::new(DeliveryQueue::new(store.clone(), QueueConfig::default()));
    let reminders = Arc::new(ReminderScheduler::new(store.clone(), 10));
    let guard = DispatchGuard::new(
        store.clone(),
        transport.clone(),
        queue,
        reminders.clone(),
        "mail.example".into(),
    );
    let ingestor = Ingestor::new(
        store.clone(),
        reminders,
        Arc::new(MemoryBlobStore::new()),
        Arc::new(LogJobDispatcher),
    );
    World {
        store,
        guard,
        ingestor,
        transport,
    }
}

async fn seed_request(store: &LibSqlBackend, id: &str) {
    store
        .insert_request(&Request {
            id: id.into(),
            recipient_email: "vendor@example.com".into(),
            subject: "Please send your W-9".into(),
            body: "We need the signed form for our records.".into(),
            status: RequestStatus::Draft,
            read_status: None,
            sent_at: None,
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
}

/// Raw MIME reply referencing the Message-ID the dispatch stamped.
fn raw_reply(in_reply_to: &str, message_id: &str, subject: &str, body: &str, from: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\nTo: inbox@mail.example\r\nSubject: {subject}\r\nMessage-ID: <{message_id}>\r\nIn-Reply-To: {in_reply_to}\r\nContent-Type: text/plain\r\n\r\n{body}\r\n"
    )
    .into_bytes()
}

#[tokio::test]
async fn genuine_reply_closes_the_loop() {
    let w = world().await;
    seed_request(&w.store, "r1").await;

    let outcome = w.guard.send("r1", Some("send-1")).await.unwrap();
    assert!(outcome.dispatched);
    assert_eq!(w.transport.sent_count(), 1);

    let stamped_header = w.transport.sent()[0].message_id_header.clone();
    let raw = raw_reply(
        &stamped_header,
        "reply-1@example.com",
        "Re: Please send your W-9",
        "Attached is the signed W-9 you asked for.",
        "vendor@example.com",
    );

    let inbound = mime_to_inbound("postmark", &raw).unwrap();
    let result = w.ingestor.ingest(inbound).await.unwrap();
    assert_eq!(result.disposition, IngestDisposition::Processed);
    assert_eq!(result.request_id.as_deref(), Some("r1"));

    let request = w.store.find_request("r1").await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Replied);
    assert_eq!(request.read_status, Some(ReadStatus::Replied));

    // The reply stopped the reminder cadence seeded at dispatch
    let state = w
        .store
        .get_reminder_state("r1", "vendor@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(state.next_send_at.is_none());
}

#[tokio::test]
async fn bounce_scenario_marks_send_failed() {
    let w = world().await;
    seed_request(&w.store, "r1").await;
    w.guard.send("r1", None).await.unwrap();

    let stamped_header = w.transport.sent()[0].message_id_header.clone();
    let raw = raw_reply(
        &stamped_header,
        "bounce-1@example.com",
        "Undeliverable: Q3 Invoice",
        "550 mailbox not found",
        "mailer-daemon@example.com",
    );

    let inbound = mime_to_inbound("postmark", &raw).unwrap();
    w.ingestor.ingest(inbound).await.unwrap();

    let request = w.store.find_request("r1").await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::SendFailed);
    assert_eq!(request.read_status, Some(ReadStatus::Bounced));

    // Observed behavior: a bounce does not stop the cadence
    let state = w
        .store
        .get_reminder_state("r1", "vendor@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(state.next_send_at.is_some());
}

#[tokio::test]
async fn out_of_office_scenario_changes_nothing() {
    let w = world().await;
    seed_request(&w.store, "r1").await;
    w.guard.send("r1", None).await.unwrap();

    let stamped_header = w.transport.sent()[0].message_id_header.clone();
    let raw = raw_reply(
        &stamped_header,
        "ooo-1@example.com",
        "Re: Please send your W-9",
        "I'm currently out of the office until Monday",
        "vendor@example.com",
    );

    let inbound = mime_to_inbound("postmark", &raw).unwrap();
    let result = w.ingestor.ingest(inbound).await.unwrap();
    assert_eq!(result.disposition, IngestDisposition::Processed);

    let request = w.store.find_request("r1").await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Sent, "status unchanged");

    let state = w
        .store
        .get_reminder_state("r1", "vendor@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(state.next_send_at.is_some(), "cadence unchanged");
}

#[tokio::test]
async fn webhook_retry_is_deduplicated() {
    let w = world().await;
    seed_request(&w.store, "r1").await;
    w.guard.send("r1", None).await.unwrap();

    let stamped_header = w.transport.sent()[0].message_id_header.clone();
    let raw = raw_reply(
        &stamped_header,
        "reply-1@example.com",
        "Re: Please send your W-9",
        "Here you go.",
        "vendor@example.com",
    );

    let first = w
        .ingestor
        .ingest(mime_to_inbound("postmark", &raw).unwrap())
        .await
        .unwrap();
    assert_eq!(first.disposition, IngestDisposition::Processed);

    // The provider retries the webhook with the same message
    let second = w
        .ingestor
        .ingest(mime_to_inbound("postmark", &raw).unwrap())
        .await
        .unwrap();
    assert_eq!(second.disposition, IngestDisposition::Duplicate);

    assert_eq!(
        w.store.list_inbound_for_request("r1").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn double_click_send_dispatches_once() {
    let w = world().await;
    seed_request(&w.store, "r1").await;

    let first = w.guard.send("r1", Some("click-1")).await.unwrap();
    let second = w.guard.send("r1", Some("click-1")).await.unwrap();

    assert!(first.dispatched);
    assert!(second.already_sent);
    assert_eq!(first.send_attempt_id, second.send_attempt_id);
    assert_eq!(w.transport.sent_count(), 1);
}
