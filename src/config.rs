//! Configuration types, built from environment variables.

use std::time::Duration;

/// SMTP transport configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILFLOW_SMTP_HOST` is not set (transport disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("MAILFLOW_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("MAILFLOW_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("MAILFLOW_SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("MAILFLOW_SMTP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("MAILFLOW_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Delivery queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Initial cool-down before the first attempt; tuned to outlive the
    /// transport's rate-limit window.
    pub base_delay: Duration,
    pub max_attempts: u32,
    /// How often the worker scans for due items.
    pub poll_interval: Duration,
    /// PROCESSING rows older than this are re-armed to PENDING at startup.
    pub stale_claim_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(300), // 5 minutes
            max_attempts: 5,
            poll_interval: Duration::from_secs(60),
            stale_claim_after: Duration::from_secs(900), // 15 minutes
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the local libSQL database file.
    pub db_path: String,
    /// HTTP bind address for webhook/send routes.
    pub bind_addr: String,
    /// Domain used for generated Message-ID headers and legacy
    /// correlation addresses (`requests+<id>@<domain>`).
    pub mail_domain: String,
    /// Interval between provider sync passes.
    pub sync_interval: Duration,
    /// Look-back window for a bootstrap fetch (null cursor).
    pub bootstrap_lookback_days: i64,
    /// Hard ceiling on configured reminder counts.
    pub reminder_max_ceiling: u32,
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "./data/mailflow.db".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            mail_domain: "mail.localhost".to_string(),
            sync_interval: Duration::from_secs(300), // 5 minutes
            bootstrap_lookback_days: 7,
            reminder_max_ceiling: 10,
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path =
            std::env::var("MAILFLOW_DB_PATH").unwrap_or(defaults.db_path);
        let bind_addr =
            std::env::var("MAILFLOW_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let mail_domain =
            std::env::var("MAILFLOW_MAIL_DOMAIN").unwrap_or(defaults.mail_domain);

        let sync_interval = std::env::var("MAILFLOW_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_interval);

        let bootstrap_lookback_days = std::env::var("MAILFLOW_BOOTSTRAP_LOOKBACK_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.bootstrap_lookback_days);

        let reminder_max_ceiling = std::env::var("MAILFLOW_REMINDER_MAX")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.reminder_max_ceiling);

        let queue = QueueConfig {
            base_delay: std::env::var("MAILFLOW_QUEUE_BASE_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.queue.base_delay),
            max_attempts: std::env::var("MAILFLOW_QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.queue.max_attempts),
            poll_interval: std::env::var("MAILFLOW_QUEUE_POLL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.queue.poll_interval),
            stale_claim_after: defaults.queue.stale_claim_after,
        };

        Self {
            db_path,
            bind_addr,
            mail_domain,
            sync_interval,
            bootstrap_lookback_days,
            reminder_max_ceiling,
            queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.queue.max_attempts, 5);
        assert!(cfg.queue.base_delay >= Duration::from_secs(60));
        assert_eq!(cfg.bootstrap_lookback_days, 7);
    }
}
