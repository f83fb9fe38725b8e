//! HTTP surface — webhook ingestion, the send endpoint, and health.
//!
//! The webhook accepts either a JSON `NormalizedInbound` payload or raw
//! MIME (`message/rfc822`); raw mail is normalized here with mail-parser
//! so everything downstream sees the one ingestion shape.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use mail_parser::{MessageParser, MimeHeaders};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::dispatch::DispatchGuard;
use crate::error::{DispatchError, Error, IngestError};
use crate::ingest::Ingestor;
use crate::model::{
    AutomationHeaders, InboundAttachment, NormalizedInbound, ProviderData, SendOutcome,
};

/// Shared route state.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub guard: Arc<DispatchGuard>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/inbound/{provider}", post(inbound_webhook))
        .route("/requests/{id}/send", post(send_request))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Webhook response body: `{ parentId, messageId }`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    parent_id: Option<String>,
    message_id: Option<Uuid>,
    disposition: crate::model::IngestDisposition,
}

async fn inbound_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::Json<IngestResponse>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let inbound = if content_type.starts_with("application/json") {
        let mut parsed: NormalizedInbound = serde_json::from_slice(&body)
            .map_err(|e| Error::Ingest(IngestError::Malformed(e.to_string())))?;
        if parsed.provider_data.provider.is_empty() {
            parsed.provider_data.provider = provider.clone();
        }
        parsed
    } else {
        mime_to_inbound(&provider, &body)?
    };

    let outcome = state.ingestor.ingest(inbound).await?;
    Ok(axum::Json(IngestResponse {
        parent_id: outcome.request_id,
        message_id: outcome.message_id,
        disposition: outcome.disposition,
    }))
}

async fn send_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<axum::Json<SendOutcome>, ApiError> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok());

    let outcome = state.guard.send(&id, idempotency_key).await?;
    Ok(axum::Json(outcome))
}

/// Normalize a raw RFC 822 message into the ingestion shape.
pub fn mime_to_inbound(provider: &str, raw: &[u8]) -> Result<NormalizedInbound, Error> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::Ingest(IngestError::Malformed("unparseable MIME".into())))?;

    let from = message
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(String::from)
        .unwrap_or_default();
    let to = message
        .to()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(String::from)
        .unwrap_or_default();
    let reply_to = message
        .reply_to()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(String::from);

    let provider_message_id = message
        .message_id()
        .map(String::from)
        .ok_or_else(|| Error::Ingest(IngestError::Malformed("missing Message-ID".into())))?;

    let header_text = |name: &str| {
        message
            .header(name)
            .and_then(|v| v.as_text())
            .map(String::from)
    };

    let mut attachments = Vec::new();
    for part in message.attachments() {
        let part: &mail_parser::MessagePart = part;
        let filename = MimeHeaders::attachment_name(part)
            .unwrap_or("attachment")
            .to_string();
        let content_type = MimeHeaders::content_type(part)
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        attachments.push(InboundAttachment {
            filename,
            content: part.contents().to_vec(),
            content_type,
        });
    }

    Ok(NormalizedInbound {
        from,
        to,
        reply_to,
        subject: message.subject().map(String::from),
        body: message.body_text(0).map(|b| b.into_owned()),
        html_body: message.body_html(0).map(|b| b.into_owned()),
        provider_message_id: provider_message_id.clone(),
        provider_data: ProviderData {
            in_reply_to: header_text("In-Reply-To"),
            references: header_text("References"),
            thread_id: None,
            message_id_header: Some(provider_message_id),
            provider: provider.to_string(),
            raw: None,
        },
        headers: AutomationHeaders {
            auto_submitted: header_text("Auto-Submitted"),
            x_auto_response_suppress: header_text("X-Auto-Response-Suppress"),
            precedence: header_text("Precedence"),
        },
        attachments,
    })
}

// ── Error mapping ───────────────────────────────────────────────────

/// Engine errors surfaced over HTTP.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Dispatch(DispatchError::RequestNotFound(_)) => StatusCode::NOT_FOUND,
            Error::Dispatch(DispatchError::NoRecipients(_))
            | Error::Dispatch(DispatchError::NotReady { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Dispatch(DispatchError::TransportFailed { .. }) => StatusCode::BAD_GATEWAY,
            Error::Ingest(IngestError::Malformed(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = axum::Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_REPLY: &[u8] = b"From: Vendor Co <vendor@example.com>\r\n\
To: inbox@mail.example\r\n\
Subject: Re: Please send your W-9\r\n\
Message-ID: <reply-1@example.com>\r\n\
In-Reply-To: <out-1@mail.example>\r\n\
Auto-Submitted: no\r\n\
Content-Type: text/plain\r\n\
\r\n\
Here you go.\r\n";

    #[test]
    fn mime_normalization_extracts_correlation_fields() {
        let inbound = mime_to_inbound("postmark", RAW_REPLY).unwrap();
        assert_eq!(inbound.from, "vendor@example.com");
        assert_eq!(inbound.to, "inbox@mail.example");
        assert_eq!(inbound.subject.as_deref(), Some("Re: Please send your W-9"));
        assert_eq!(inbound.provider_message_id, "reply-1@example.com");
        let in_reply_to = inbound.provider_data.in_reply_to.as_deref().unwrap();
        assert_eq!(
            crate::correlate::normalize_message_id(in_reply_to),
            "out-1@mail.example"
        );
        assert_eq!(inbound.provider_data.provider, "postmark");
        assert_eq!(inbound.headers.auto_submitted.as_deref(), Some("no"));
        assert_eq!(inbound.body.as_deref().map(str::trim), Some("Here you go."));
    }

    #[test]
    fn mime_without_message_id_is_rejected() {
        let raw = b"From: a@x.com\r\nTo: b@y.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let err = mime_to_inbound("postmark", raw).unwrap_err();
        assert!(matches!(err, Error::Ingest(IngestError::Malformed(_))));
    }

    #[test]
    fn mime_with_out_of_office_headers() {
        let raw = b"From: carol@example.com\r\n\
To: inbox@mail.example\r\n\
Subject: Automatic reply: Q3 numbers\r\n\
Message-ID: <ooo-1@example.com>\r\n\
X-Auto-Response-Suppress: All\r\n\
Precedence: auto_reply\r\n\
Content-Type: text/plain\r\n\
\r\n\
I am out of the office.\r\n";
        let inbound = mime_to_inbound("postmark", raw).unwrap();
        assert_eq!(
            inbound.headers.x_auto_response_suppress.as_deref(),
            Some("All")
        );
        assert_eq!(inbound.headers.precedence.as_deref(), Some("auto_reply"));
    }
}
