//! Reply correlation — match an inbound email to the outbound
//! conversation that produced it.
//!
//! Strategies run in strict priority order, first success wins:
//!
//! 1. Message-ID threading (`In-Reply-To` against stored Message-ID
//!    headers) — a mail-protocol-level guarantee.
//! 2. Provider thread/conversation id — reliable within one provider.
//! 3. Subject heuristic — explicitly a fallback, not a safety property.
//! 4. Legacy correlation token in the reply-to/to local part.
//!
//! When nothing matches, a structured orphan event is logged with a
//! hashed sender identity (never the raw address) and the set of
//! identifiers present, and the caller dead-letters the message.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::model::NormalizedInbound;
use crate::store::Store;

/// Stripped reply subjects at or below this length are too generic to
/// match on.
const SUBJECT_MIN_LEN: usize = 5;

/// Finds the request an inbound message replies to.
pub struct Correlator {
    store: Arc<dyn Store>,
}

impl Correlator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns the correlated request id, or `None` when no strategy
    /// matched (the orphan event is logged here).
    pub async fn correlate(
        &self,
        inbound: &NormalizedInbound,
    ) -> Result<Option<String>, DatabaseError> {
        // 1. Message-ID threading
        if let Some(in_reply_to) = inbound.provider_data.in_reply_to.as_deref() {
            let normalized = normalize_message_id(in_reply_to);
            if !normalized.is_empty()
                && let Some(outbound) = self
                    .store
                    .find_outbound_by_message_id_header(normalized)
                    .await?
            {
                debug!(request_id = %outbound.request_id, strategy = "message_id", "Inbound correlated");
                return Ok(Some(outbound.request_id));
            }
        }

        // 2. Provider thread id
        if let Some(thread_id) = inbound.provider_data.thread_id.as_deref()
            && !thread_id.is_empty()
            && let Some(outbound) = self.store.find_outbound_by_thread_id(thread_id).await?
        {
            debug!(request_id = %outbound.request_id, strategy = "thread_id", "Inbound correlated");
            return Ok(Some(outbound.request_id));
        }

        // 3. Subject heuristic
        if let Some(subject) = inbound.subject.as_deref() {
            let stripped = strip_reply_prefix(subject);
            if stripped.len() > SUBJECT_MIN_LEN
                && let Some(outbound) =
                    self.store.find_latest_outbound_by_subject(stripped).await?
            {
                debug!(request_id = %outbound.request_id, strategy = "subject", "Inbound correlated");
                return Ok(Some(outbound.request_id));
            }
        }

        // 4. Legacy token in the reply-to/to local part
        for address in [inbound.reply_to.as_deref(), Some(inbound.to.as_str())]
            .into_iter()
            .flatten()
        {
            if let Some(token) = extract_plus_token(address)
                && self.store.find_request(token).await?.is_some()
            {
                debug!(request_id = %token, strategy = "legacy_token", "Inbound correlated");
                return Ok(Some(token.to_string()));
            }
        }

        warn!(
            sender_hash = %hash_identity(&inbound.from),
            provider = %inbound.provider_data.provider,
            provider_message_id = %inbound.provider_message_id,
            has_in_reply_to = inbound.provider_data.in_reply_to.is_some(),
            has_thread_id = inbound.provider_data.thread_id.is_some(),
            has_subject = inbound.subject.is_some(),
            "Orphaned inbound: no correlation strategy matched"
        );
        Ok(None)
    }
}

/// Strip angle brackets and surrounding whitespace from a Message-ID
/// header value.
pub fn normalize_message_id(raw: &str) -> &str {
    raw.trim().trim_start_matches('<').trim_end_matches('>')
}

/// Remove leading reply markers ("Re:"/"RE:"), repeatedly, so
/// "Re: RE: subject" strips to "subject".
pub fn strip_reply_prefix(subject: &str) -> &str {
    let mut s = subject.trim();
    loop {
        let lower = s.to_lowercase();
        if lower.starts_with("re:") {
            s = s[3..].trim_start();
        } else {
            return s;
        }
    }
}

/// Extract the `+`-suffix of an address local part:
/// `requests+abc123@domain` → `abc123`.
pub fn extract_plus_token(address: &str) -> Option<&str> {
    let local = address.split('@').next()?;
    let (_, token) = local.split_once('+')?;
    if token.is_empty() { None } else { Some(token) }
}

/// Short sha2 digest of a counterparty identity, for log lines.
pub fn hash_identity(address: &str) -> String {
    let digest = Sha256::digest(address.trim().to_lowercase().as_bytes());
    format!("{digest:x}")[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::model::{
        OutboundMessage, ProviderData, ReminderConfig, Request, RequestStatus,
    };
    use crate::store::{LibSqlBackend, RequestStore, Store as _};

    fn inbound(
        in_reply_to: Option<&str>,
        thread_id: Option<&str>,
        subject: Option<&str>,
    ) -> NormalizedInbound {
        NormalizedInbound {
            from: "vendor@example.com".into(),
            to: "inbox@mail.example".into(),
            reply_to: None,
            subject: subject.map(String::from),
            body: Some("body".into()),
            html_body: None,
            provider_message_id: format!("pm-{}", Uuid::new_v4()),
            provider_data: ProviderData {
                in_reply_to: in_reply_to.map(String::from),
                references: None,
                thread_id: thread_id.map(String::from),
                message_id_header: None,
                provider: "gmail".into(),
                raw: None,
            },
            headers: Default::default(),
            attachments: vec![],
        }
    }

    fn outbound(request_id: &str, header: &str, thread_id: Option<&str>, subject: &str) -> OutboundMessage {
        OutboundMessage {
            id: Uuid::new_v4(),
            request_id: request_id.into(),
            recipient: "vendor@example.com".into(),
            subject: subject.into(),
            body: "body".into(),
            provider_message_id: None,
            provider_thread_id: thread_id.map(String::from),
            message_id_header: header.into(),
            sent_at: Utc::now(),
        }
    }

    async fn correlator() -> (Correlator, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (Correlator::new(db.clone()), db)
    }

    #[tokio::test]
    async fn message_id_beats_conflicting_thread_id() {
        let (correlator, db) = correlator().await;
        db.insert_outbound(&outbound("r-header", "<mid-1@mail.example>", None, "A"))
            .await
            .unwrap();
        db.insert_outbound(&outbound("r-thread", "<mid-2@mail.example>", Some("t-9"), "B"))
            .await
            .unwrap();

        // In-Reply-To points at r-header while the thread id points at
        // r-thread; strategy 1 must win.
        let msg = inbound(Some("<mid-1@mail.example>"), Some("t-9"), None);
        let result = correlator.correlate(&msg).await.unwrap();
        assert_eq!(result.as_deref(), Some("r-header"));
    }

    #[tokio::test]
    async fn thread_id_fallback() {
        let (correlator, db) = correlator().await;
        db.insert_outbound(&outbound("r1", "<mid-1@mail.example>", Some("t-1"), "A"))
            .await
            .unwrap();

        let msg = inbound(None, Some("t-1"), None);
        let result = correlator.correlate(&msg).await.unwrap();
        assert_eq!(result.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn subject_fallback_requires_minimum_length() {
        let (correlator, db) = correlator().await;
        db.insert_outbound(&outbound("r1", "<mid-1@mail.example>", None, "Q3 Invoice"))
            .await
            .unwrap();

        let msg = inbound(None, None, Some("Re: Q3 Invoice"));
        let result = correlator.correlate(&msg).await.unwrap();
        assert_eq!(result.as_deref(), Some("r1"));

        // Short generic subjects never match
        let db2 = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db2.insert_outbound(&outbound("r2", "<mid-2@mail.example>", None, "Hi"))
            .await
            .unwrap();
        let correlator2 = Correlator::new(db2);
        let msg = inbound(None, None, Some("Re: Hi"));
        let result = correlator2.correlate(&msg).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn legacy_token_fallback() {
        let (correlator, db) = correlator().await;
        db.insert_request(&Request {
            id: "req-42".into(),
            recipient_email: "vendor@example.com".into(),
            subject: "s".into(),
            body: "b".into(),
            status: RequestStatus::Sent,
            read_status: None,
            sent_at: Some(Utc::now()),
            send_attempt_id: None,
            reminder_config: ReminderConfig::default(),
        })
        .await
        .unwrap();

        let mut msg = inbound(None, None, None);
        msg.to = "requests+req-42@mail.example".into();
        let result = correlator.correlate(&msg).await.unwrap();
        assert_eq!(result.as_deref(), Some("req-42"));
    }

    #[tokio::test]
    async fn legacy_token_must_reference_existing_request() {
        let (correlator, _db) = correlator().await;
        let mut msg = inbound(None, None, None);
        msg.to = "requests+ghost@mail.example".into();
        let result = correlator.correlate(&msg).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn orphan_returns_none() {
        let (correlator, _db) = correlator().await;
        let msg = inbound(Some("<unknown@mail.example>"), Some("t-none"), Some("Re: Nothing here"));
        let result = correlator.correlate(&msg).await.unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn message_id_normalization() {
        assert_eq!(normalize_message_id(" <abc@x> "), "abc@x");
        assert_eq!(normalize_message_id("abc@x"), "abc@x");
        assert_eq!(normalize_message_id("<>"), "");
    }

    #[test]
    fn reply_prefix_stripping() {
        assert_eq!(strip_reply_prefix("Re: Hello"), "Hello");
        assert_eq!(strip_reply_prefix("RE: re: Hello"), "Hello");
        assert_eq!(strip_reply_prefix("Hello"), "Hello");
        assert_eq!(strip_reply_prefix("  Re:   Spaced  "), "Spaced");
    }

    #[test]
    fn plus_token_extraction() {
        assert_eq!(extract_plus_token("requests+abc@x.com"), Some("abc"));
        assert_eq!(extract_plus_token("requests@x.com"), None);
        assert_eq!(extract_plus_token("requests+@x.com"), None);
    }

    #[test]
    fn identity_hash_is_stable_and_not_raw() {
        let h1 = hash_identity("Vendor@Example.com");
        let h2 = hash_identity("vendor@example.com ");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 12);
        assert!(!h1.contains('@'));
    }
}
