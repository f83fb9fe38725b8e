//! Provider adapter seam and registry.
//!
//! Each mail provider exposes the same two operations: an incremental
//! fetch from an opaque cursor, and a credential refresh. Adapters are
//! injected through the registry; a provider without an adapter is an
//! explicit `UnsupportedProvider` error, not a silent skip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::model::{AccountCredentials, ConnectedAccount, FetchPage, Provider};

/// Fresh credentials returned by a provider token refresh.
#[derive(Debug, Clone)]
pub struct RefreshedCredentials {
    pub credentials: AccountCredentials,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One mail provider's sync surface.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Fetch inbound mail newer than the cursor. A `None` cursor triggers
    /// a bounded look-back bootstrap, never an unbounded historical scan.
    async fn fetch_inbound_since_cursor(
        &self,
        account: &ConnectedAccount,
        cursor: Option<&str>,
    ) -> Result<FetchPage, SyncError>;

    /// Exchange the refresh token for a new access token.
    /// An invalid-grant class failure maps to `SyncError::CredentialRevoked`.
    async fn refresh_credentials(
        &self,
        account: &ConnectedAccount,
    ) -> Result<RefreshedCredentials, SyncError>;
}

/// Registry of provider adapters, keyed by provider.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, SyncError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| SyncError::UnsupportedProvider(provider.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyAdapter;

    #[async_trait]
    impl ProviderAdapter for DummyAdapter {
        fn provider(&self) -> Provider {
            Provider::Gmail
        }

        async fn fetch_inbound_since_cursor(
            &self,
            _account: &ConnectedAccount,
            _cursor: Option<&str>,
        ) -> Result<FetchPage, SyncError> {
            Ok(FetchPage {
                messages: vec![],
                next_cursor: None,
                bootstrap_performed: false,
            })
        }

        async fn refresh_credentials(
            &self,
            _account: &ConnectedAccount,
        ) -> Result<RefreshedCredentials, SyncError> {
            Err(SyncError::Provider {
                provider: "gmail".into(),
                reason: "not implemented".into(),
            })
        }
    }

    #[test]
    fn unregistered_provider_is_an_explicit_error() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(DummyAdapter));

        assert!(registry.get(Provider::Gmail).is_ok());
        let err = registry.get(Provider::Outlook).err().unwrap();
        assert!(matches!(err, SyncError::UnsupportedProvider(p) if p == "outlook"));
    }
}
