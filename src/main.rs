use std::sync::Arc;
use std::sync::atomic::Ordering;

use secrecy::SecretString;

use mailflow::config::{Config, SmtpConfig};
use mailflow::dispatch::DispatchGuard;
use mailflow::ingest::{Ingestor, LogJobDispatcher, MemoryBlobStore};
use mailflow::queue::{DeliveryQueue, spawn_queue_worker};
use mailflow::reminder::ReminderScheduler;
use mailflow::routes::{AppState, router};
use mailflow::store::{LibSqlBackend, Store};
use mailflow::sync::gmail::GmailAdapter;
use mailflow::sync::outlook::OutlookAdapter;
use mailflow::sync::provider::ProviderRegistry;
use mailflow::sync::{SyncCursorManager, spawn_sync_loop};
use mailflow::transport::{MailTransport, SmtpMailTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env();

    let smtp_config = SmtpConfig::from_env().unwrap_or_else(|| {
        eprintln!("Error: MAILFLOW_SMTP_HOST not set");
        eprintln!("  export MAILFLOW_SMTP_HOST=smtp.example.com");
        std::process::exit(1);
    });

    eprintln!("📨 Mailflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Listening: http://{}", config.bind_addr);

    // ── Database ─────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
            std::process::exit(1);
        }),
    );

    // ── Core components ──────────────────────────────────────────────
    let transport: Arc<dyn MailTransport> = Arc::new(SmtpMailTransport::new(smtp_config));
    let queue = Arc::new(DeliveryQueue::new(store.clone(), config.queue.clone()));
    let reminders = Arc::new(ReminderScheduler::new(
        store.clone(),
        config.reminder_max_ceiling,
    ));
    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        reminders.clone(),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(LogJobDispatcher),
    ));
    let guard = Arc::new(DispatchGuard::new(
        store.clone(),
        transport.clone(),
        queue.clone(),
        reminders,
        config.mail_domain.clone(),
    ));

    // ── Provider sync ────────────────────────────────────────────────
    let mut registry = ProviderRegistry::new();
    if let (Ok(id), Ok(secret)) = (
        std::env::var("MAILFLOW_GOOGLE_CLIENT_ID"),
        std::env::var("MAILFLOW_GOOGLE_CLIENT_SECRET"),
    ) {
        registry.register(Arc::new(GmailAdapter::new(
            id,
            SecretString::from(secret),
            config.bootstrap_lookback_days,
        )));
        eprintln!("   Provider: gmail enabled");
    }
    if let (Ok(id), Ok(secret)) = (
        std::env::var("MAILFLOW_MSFT_CLIENT_ID"),
        std::env::var("MAILFLOW_MSFT_CLIENT_SECRET"),
    ) {
        registry.register(Arc::new(OutlookAdapter::new(
            id,
            SecretString::from(secret),
            config.bootstrap_lookback_days,
        )));
        eprintln!("   Provider: outlook enabled");
    }

    let sync_manager = Arc::new(SyncCursorManager::new(
        store.clone(),
        Arc::new(registry),
        ingestor.clone(),
    ));
    let (_sync_handle, sync_shutdown) = spawn_sync_loop(sync_manager, config.sync_interval);

    // ── Delivery queue worker ────────────────────────────────────────
    let (_queue_handle, queue_shutdown) = spawn_queue_worker(queue, transport);

    // ── HTTP server ──────────────────────────────────────────────────
    let app = router(AppState { ingestor, guard });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            sync_shutdown.store(true, Ordering::Relaxed);
            queue_shutdown.store(true, Ordering::Relaxed);
        })
        .await?;

    Ok(())
}

/// Initialize tracing: stdout by default, a daily-rolling file layer
/// when MAILFLOW_LOG_DIR is set.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if let Ok(dir) = std::env::var("MAILFLOW_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "mailflow.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // Keep the flush guard alive for the process lifetime.
        Box::leak(Box::new(guard));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}
