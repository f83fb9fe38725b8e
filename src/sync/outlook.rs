//! Outlook sync adapter — Microsoft Graph delta queries.
//!
//! The cursor is the opaque `@odata.deltaLink` URL Graph hands back. A
//! null cursor starts a delta round bounded to the look-back window.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::SyncError;
use crate::model::{
    AccountCredentials, AutomationHeaders, ConnectedAccount, FetchPage, NormalizedInbound,
    Provider, ProviderData,
};
use crate::sync::provider::{ProviderAdapter, RefreshedCredentials};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

pub struct OutlookAdapter {
    http: reqwest::Client,
    client_id: String,
    client_secret: SecretString,
    lookback_days: i64,
}

impl OutlookAdapter {
    pub fn new(client_id: String, client_secret: SecretString, lookback_days: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            lookback_days,
        }
    }

    fn provider_error(e: impl std::fmt::Display) -> SyncError {
        SyncError::Provider {
            provider: "outlook".into(),
            reason: e.to_string(),
        }
    }

    fn bootstrap_url(&self) -> String {
        let since = (Utc::now() - Duration::days(self.lookback_days))
            .format("%Y-%m-%dT%H:%M:%SZ");
        format!(
            "{GRAPH_BASE}/me/mailFolders/inbox/messages/delta?$filter=receivedDateTime%20ge%20{since}&$select=subject,bodyPreview,body,from,toRecipients,replyTo,conversationId,internetMessageId,internetMessageHeaders"
        )
    }
}

#[async_trait]
impl ProviderAdapter for OutlookAdapter {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    async fn fetch_inbound_since_cursor(
        &self,
        account: &ConnectedAccount,
        cursor: Option<&str>,
    ) -> Result<FetchPage, SyncError> {
        let bootstrap_performed = cursor.is_none();
        let mut url = cursor
            .map(String::from)
            .unwrap_or_else(|| self.bootstrap_url());

        let mut messages = Vec::new();
        let next_cursor = loop {
            let response = self
                .http
                .get(&url)
                .bearer_auth(account.credentials.access_token.expose_secret())
                .send()
                .await
                .map_err(Self::provider_error)?;

            if !response.status().is_success() {
                return Err(Self::provider_error(format!(
                    "delta query returned {}",
                    response.status()
                )));
            }

            let page: DeltaResponse = response.json().await.map_err(Self::provider_error)?;
            messages.extend(page.value.into_iter().map(message_to_inbound));

            if let Some(next) = page.next_link {
                url = next;
            } else {
                break page.delta_link;
            }
        };

        debug!(count = messages.len(), bootstrap = bootstrap_performed, "Outlook fetch");
        Ok(FetchPage {
            messages,
            next_cursor,
            bootstrap_performed,
        })
    }

    async fn refresh_credentials(
        &self,
        account: &ConnectedAccount,
    ) -> Result<RefreshedCredentials, SyncError> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                (
                    "refresh_token",
                    account.credentials.refresh_token.expose_secret(),
                ),
                ("grant_type", "refresh_token"),
                ("scope", "https://graph.microsoft.com/Mail.Read offline_access"),
            ])
            .send()
            .await
            .map_err(Self::provider_error)?;

        let status = response.status();
        let body = response.text().await.map_err(Self::provider_error)?;

        if !status.is_success() {
            // AADSTS50173/70000 class errors carry invalid_grant.
            if body.contains("invalid_grant") {
                return Err(SyncError::CredentialRevoked {
                    account_id: account.id,
                });
            }
            return Err(Self::provider_error(format!("token endpoint {status}: {body}")));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(Self::provider_error)?;
        Ok(RefreshedCredentials {
            credentials: AccountCredentials {
                access_token: SecretString::from(token.access_token),
                refresh_token: token
                    .refresh_token
                    .map(SecretString::from)
                    .unwrap_or_else(|| account.credentials.refresh_token.clone()),
            },
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Deserialize, Default)]
struct DeltaResponse {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct GraphMessage {
    id: String,
    subject: Option<String>,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    body: Option<GraphBody>,
    from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients", default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(rename = "replyTo", default)]
    reply_to: Vec<GraphRecipient>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(rename = "internetMessageId")]
    internet_message_id: Option<String>,
    #[serde(rename = "internetMessageHeaders", default)]
    internet_message_headers: Vec<GraphHeader>,
}

#[derive(Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: GraphAddress,
}

#[derive(Deserialize)]
struct GraphAddress {
    address: String,
}

#[derive(Deserialize)]
struct GraphHeader {
    name: String,
    value: String,
}

fn header<'a>(message: &'a GraphMessage, name: &str) -> Option<&'a str> {
    message
        .internet_message_headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

pub(crate) fn message_to_inbound(message: GraphMessage) -> NormalizedInbound {
    let (body, html_body) = match &message.body {
        Some(b) if b.content_type.as_deref() == Some("html") => (
            message.body_preview.clone(),
            b.content.clone(),
        ),
        Some(b) => (b.content.clone().or_else(|| message.body_preview.clone()), None),
        None => (message.body_preview.clone(), None),
    };

    NormalizedInbound {
        from: message
            .from
            .as_ref()
            .map(|r| r.email_address.address.clone())
            .unwrap_or_default(),
        to: message
            .to_recipients
            .first()
            .map(|r| r.email_address.address.clone())
            .unwrap_or_default(),
        reply_to: message
            .reply_to
            .first()
            .map(|r| r.email_address.address.clone()),
        subject: message.subject.clone(),
        body,
        html_body,
        provider_message_id: message.id.clone(),
        provider_data: ProviderData {
            in_reply_to: header(&message, "In-Reply-To").map(String::from),
            references: header(&message, "References").map(String::from),
            thread_id: message.conversation_id.clone(),
            message_id_header: message.internet_message_id.clone(),
            provider: Provider::Outlook.as_str().to_string(),
            raw: None,
        },
        headers: AutomationHeaders {
            auto_submitted: header(&message, "Auto-Submitted").map(String::from),
            x_auto_response_suppress: header(&message, "X-Auto-Response-Suppress")
                .map(String::from),
            precedence: header(&message, "Precedence").map(String::from),
        },
        attachments: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_graph_message() {
        let message: GraphMessage = serde_json::from_value(serde_json::json!({
            "id": "AAMk-1",
            "subject": "Re: Please send your W-9",
            "bodyPreview": "Here you go.",
            "body": {"contentType": "html", "content": "<p>Here you go.</p>"},
            "from": {"emailAddress": {"address": "vendor@example.com"}},
            "toRecipients": [{"emailAddress": {"address": "inbox@mail.example"}}],
            "conversationId": "conv-1",
            "internetMessageId": "<graph-1@outlook.com>",
            "internetMessageHeaders": [
                {"name": "In-Reply-To", "value": "<out-1@mail.example>"},
                {"name": "X-Auto-Response-Suppress", "value": "All"}
            ]
        }))
        .unwrap();

        let inbound = message_to_inbound(message);
        assert_eq!(inbound.from, "vendor@example.com");
        assert_eq!(inbound.body.as_deref(), Some("Here you go."));
        assert_eq!(inbound.html_body.as_deref(), Some("<p>Here you go.</p>"));
        assert_eq!(inbound.provider_data.thread_id.as_deref(), Some("conv-1"));
        assert_eq!(
            inbound.provider_data.in_reply_to.as_deref(),
            Some("<out-1@mail.example>")
        );
        assert_eq!(inbound.headers.x_auto_response_suppress.as_deref(), Some("All"));
        assert_eq!(inbound.provider_data.provider, "outlook");
    }

    #[test]
    fn missing_fields_default_empty() {
        let message: GraphMessage =
            serde_json::from_value(serde_json::json!({"id": "AAMk-2"})).unwrap();
        let inbound = message_to_inbound(message);
        assert_eq!(inbound.from, "");
        assert_eq!(inbound.subject, None);
        assert_eq!(inbound.provider_message_id, "AAMk-2");
    }
}
