//! Gmail sync adapter — REST polling over the Gmail API.
//!
//! The cursor is Gmail's `historyId`. A null cursor bootstraps from a
//! bounded `newer_than:` query instead of walking full history.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
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

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const PAGE_SIZE: u32 = 50;

pub struct GmailAdapter {
    http: reqwest::Client,
    client_id: String,
    client_secret: SecretString,
    lookback_days: i64,
}

impl GmailAdapter {
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
            provider: "gmail".into(),
            reason: e.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        account: &ConnectedAccount,
        url: &str,
    ) -> Result<T, SyncError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(account.credentials.access_token.expose_secret())
            .send()
            .await
            .map_err(Self::provider_error)?;

        if !response.status().is_success() {
            return Err(Self::provider_error(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        response.json().await.map_err(Self::provider_error)
    }

    /// List message ids newer than the cursor, or bootstrap from the
    /// look-back window.
    async fn list_new_message_ids(
        &self,
        account: &ConnectedAccount,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>, bool), SyncError> {
        match cursor {
            Some(history_id) => {
                let url = format!(
                    "{API_BASE}/history?startHistoryId={history_id}&historyTypes=messageAdded&maxResults={PAGE_SIZE}"
                );
                let page: HistoryResponse = self.get_json(account, &url).await?;
                let ids = page
                    .history
                    .into_iter()
                    .flat_map(|h| h.messages_added)
                    .map(|m| m.message.id)
                    .collect();
                Ok((ids, page.history_id, false))
            }
            None => {
                let url = format!(
                    "{API_BASE}/messages?q=in:inbox+newer_than:{}d&maxResults={PAGE_SIZE}",
                    self.lookback_days
                );
                let page: MessageListResponse = self.get_json(account, &url).await?;
                let ids = page.messages.into_iter().map(|m| m.id).collect();

                // The profile's historyId becomes the starting cursor.
                let profile: ProfileResponse =
                    self.get_json(account, &format!("{API_BASE}/profile")).await?;
                Ok((ids, Some(profile.history_id), true))
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    async fn fetch_inbound_since_cursor(
        &self,
        account: &ConnectedAccount,
        cursor: Option<&str>,
    ) -> Result<FetchPage, SyncError> {
        let (ids, next_cursor, bootstrap_performed) =
            self.list_new_message_ids(account, cursor).await?;
        debug!(count = ids.len(), bootstrap = bootstrap_performed, "Gmail fetch");

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let url = format!("{API_BASE}/messages/{id}?format=full");
            let full: GmailMessage = self.get_json(account, &url).await?;
            messages.push(message_to_inbound(full));
        }

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
            ])
            .send()
            .await
            .map_err(Self::provider_error)?;

        let status = response.status();
        let body = response.text().await.map_err(Self::provider_error)?;

        if !status.is_success() {
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
                refresh_token: account.credentials.refresh_token.clone(),
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
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct ProfileResponse {
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Deserialize, Default)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize, Default)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(rename = "messagesAdded", default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Deserialize)]
pub(crate) struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(default)]
    snippet: String,
    payload: GmailPayload,
}

#[derive(Deserialize, Default)]
pub(crate) struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPayload>,
}

#[derive(Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct GmailBody {
    data: Option<String>,
}

fn header<'a>(payload: &'a GmailPayload, name: &str) -> Option<&'a str> {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Depth-first search for the first decodable part of the given MIME type.
fn find_body(payload: &GmailPayload, mime_type: &str) -> Option<String> {
    if payload.mime_type == mime_type
        && let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref())
        && let Ok(bytes) = URL_SAFE
            .decode(data.as_bytes())
            .or_else(|_| URL_SAFE_NO_PAD.decode(data.as_bytes()))
    {
        return Some(String::from_utf8_lossy(&bytes).into_owned());
    }
    payload.parts.iter().find_map(|p| find_body(p, mime_type))
}

/// Extract the address from a display form like `Name <addr@x>`.
fn extract_address(raw: &str) -> String {
    match (raw.find('<'), raw.find('>')) {
        (Some(start), Some(end)) if end > start => raw[start + 1..end].to_string(),
        _ => raw.trim().to_string(),
    }
}

pub(crate) fn message_to_inbound(message: GmailMessage) -> NormalizedInbound {
    let payload = &message.payload;
    let body = find_body(payload, "text/plain").unwrap_or_else(|| message.snippet.clone());
    let html_body = find_body(payload, "text/html");

    NormalizedInbound {
        from: header(payload, "From").map(extract_address).unwrap_or_default(),
        to: header(payload, "To").map(extract_address).unwrap_or_default(),
        reply_to: header(payload, "Reply-To").map(extract_address),
        subject: header(payload, "Subject").map(String::from),
        body: Some(body),
        html_body,
        provider_message_id: message.id.clone(),
        provider_data: ProviderData {
            in_reply_to: header(payload, "In-Reply-To").map(String::from),
            references: header(payload, "References").map(String::from),
            thread_id: message.thread_id.clone(),
            message_id_header: header(payload, "Message-ID").map(String::from),
            provider: Provider::Gmail.as_str().to_string(),
            raw: None,
        },
        headers: AutomationHeaders {
            auto_submitted: header(payload, "Auto-Submitted").map(String::from),
            x_auto_response_suppress: header(payload, "X-Auto-Response-Suppress")
                .map(String::from),
            precedence: header(payload, "Precedence").map(String::from),
        },
        attachments: vec![],
    }
}
