//! Connected-account credential lifecycle.
//!
//! Tokens are refreshed proactively ahead of a 5-minute-to-expiry
//! buffer. A refresh failure of the invalid-grant class is terminal for
//! the account: it is deactivated and never retried automatically, so a
//! permanently invalid token does not hammer the provider.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::SyncError;
use crate::model::ConnectedAccount;
use crate::store::Store;
use crate::sync::provider::ProviderAdapter;

/// Refresh this long before the recorded expiry.
const EXPIRY_BUFFER_MINUTES: i64 = 5;

/// Ensure the account's access token is valid for at least the buffer
/// window, refreshing through the provider when it is not.
///
/// On `CredentialRevoked` the account is marked inactive before the
/// error propagates; the caller surfaces a reconnect-required message.
pub async fn ensure_fresh_credentials(
    store: &Arc<dyn Store>,
    adapter: &dyn ProviderAdapter,
    account: &mut ConnectedAccount,
) -> Result<(), SyncError> {
    let Some(expires_at) = account.token_expires_at else {
        // No recorded expiry — assume the token is long-lived.
        return Ok(());
    };

    if expires_at > Utc::now() + Duration::minutes(EXPIRY_BUFFER_MINUTES) {
        return Ok(());
    }

    debug!(account_id = %account.id, "Access token near expiry — refreshing");
    match adapter.refresh_credentials(account).await {
        Ok(refreshed) => {
            store
                .update_account_credentials(
                    account.id,
                    &refreshed.credentials,
                    refreshed.expires_at,
                )
                .await
                .map_err(|e| SyncError::RefreshFailed {
                    account_id: account.id,
                    reason: e.to_string(),
                })?;
            account.credentials = refreshed.credentials;
            account.token_expires_at = refreshed.expires_at;
            info!(account_id = %account.id, "Credentials refreshed");
            Ok(())
        }
        Err(SyncError::CredentialRevoked { account_id }) => {
            error!(
                account_id = %account_id,
                "Refresh token revoked — deactivating account, reconnect required"
            );
            store
                .deactivate_account(account.id)
                .await
                .map_err(|e| SyncError::RefreshFailed {
                    account_id: account.id,
                    reason: e.to_string(),
                })?;
            Err(SyncError::CredentialRevoked { account_id })
        }
        Err(e) => Err(e),
    }
}
