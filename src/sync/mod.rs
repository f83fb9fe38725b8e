//! Provider-cursor incremental sync — the durable polling fallback
//! behind best-effort push webhooks.
//!
//! Every fetched message enters the same ingestion entry point as the
//! webhook path, so the (provider message id, provider) dedup guard
//! makes overlapping fetch windows and double delivery harmless. Cursor
//! persistence is a merge keyed by provider; one provider's update never
//! clobbers another's.

pub mod gmail;
pub mod outlook;
pub mod provider;

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accounts::ensure_fresh_credentials;
use crate::error::SyncError;
use crate::ingest::Ingestor;
use crate::model::{ConnectedAccount, IngestDisposition, SyncReport};
use crate::store::Store;
use self::provider::ProviderRegistry;

/// Outcome of syncing one account.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountSyncOutcome {
    pub fetched: u32,
    pub persisted: u32,
    pub duplicates: u32,
    pub orphans: u32,
}

/// Drives per-account incremental fetches and cursor persistence.
pub struct SyncCursorManager {
    store: Arc<dyn Store>,
    registry: Arc<ProviderRegistry>,
    ingestor: Arc<Ingestor>,
}

impl SyncCursorManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProviderRegistry>,
        ingestor: Arc<Ingestor>,
    ) -> Self {
        Self {
            store,
            registry,
            ingestor,
        }
    }

    /// Sync one account: refresh credentials if near expiry, fetch from
    /// the stored cursor, ingest each message, merge the new cursor.
    pub async fn sync_account(
        &self,
        account: &ConnectedAccount,
    ) -> Result<AccountSyncOutcome, SyncError> {
        let adapter = self.registry.get(account.provider)?;
        let mut account = account.clone();
        ensure_fresh_credentials(&self.store, adapter.as_ref(), &mut account).await?;

        let provider_name = account.provider.as_str();
        let cursor = account.sync_cursor.get(provider_name).cloned();
        let page = adapter
            .fetch_inbound_since_cursor(&account, cursor.as_deref())
            .await?;

        let mut outcome = AccountSyncOutcome {
            fetched: page.messages.len() as u32,
            ..Default::default()
        };

        for message in page.messages {
            let provider_message_id = message.provider_message_id.clone();
            match self.ingestor.ingest(message).await {
                Ok(result) => match result.disposition {
                    IngestDisposition::Processed => outcome.persisted += 1,
                    IngestDisposition::Duplicate => outcome.duplicates += 1,
                    IngestDisposition::DeadLettered => outcome.orphans += 1,
                },
                Err(e) => {
                    // One bad message never sinks the account's pass.
                    warn!(
                        account_id = %account.id,
                        provider_message_id = %provider_message_id,
                        "Failed to ingest fetched message: {e}"
                    );
                }
            }
        }

        if let Some(next_cursor) = page.next_cursor
            && Some(&next_cursor) != cursor.as_ref()
        {
            self.store
                .merge_sync_cursor(account.id, provider_name, &next_cursor, Utc::now())
                .await
                .map_err(|e| SyncError::Provider {
                    provider: provider_name.to_string(),
                    reason: format!("cursor persistence failed: {e}"),
                })?;
        }

        info!(
            account_id = %account.id,
            provider = provider_name,
            fetched = outcome.fetched,
            persisted = outcome.persisted,
            duplicates = outcome.duplicates,
            orphans = outcome.orphans,
            bootstrap = page.bootstrap_performed,
            "Account synced"
        );
        Ok(outcome)
    }

    /// Sync every active account. A provider failure for one account is
    /// counted and logged; the loop continues to the next account.
    pub async fn run_sync_pass(&self) -> SyncReport {
        let accounts = match self.store.list_active_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to list accounts for sync pass: {e}");
                return SyncReport::default();
            }
        };

        let mut report = SyncReport::default();
        for account in accounts {
            match self.sync_account(&account).await {
                Ok(outcome) => {
                    report.accounts_synced += 1;
                    report.fetched += outcome.fetched;
                    report.persisted += outcome.persisted;
                    report.duplicates += outcome.duplicates;
                    report.orphans += outcome.orphans;
                }
                Err(e) => {
                    report.accounts_failed += 1;
                    error!(account_id = %account.id, "Account sync failed: {e}");
                }
            }
        }

        info!(
            accounts_synced = report.accounts_synced,
            accounts_failed = report.accounts_failed,
            fetched = report.fetched,
            persisted = report.persisted,
            "Sync pass complete"
        );
        report
    }
}

/// Spawn the periodic sync loop. Set the returned flag to stop it.
pub fn spawn_sync_loop(
    manager: Arc<SyncCursorManager>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Sync loop started — passing every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(Duration::from_secs(interval.as_secs().max(1)));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Sync loop shutting down");
                return;
            }

            manager.run_sync_pass().await;
        }
    });

    (handle, shutdown_flag)
}
