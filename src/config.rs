use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub api_base_url: String,
    pub username: String,
    pub log_level: String,
    pub debounce_window: Duration,
    pub reconnect: ReconnectPolicy,
    pub http_timeout: Duration,
    /// Zero disables the periodic reconciliation pull.
    pub reconcile_interval: Option<Duration>,
    pub journal_file: Option<PathBuf>,
    pub journal_max_size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5000/ws".to_string(),
            api_base_url: "http://127.0.0.1:5000/api/".to_string(),
            username: "Anonymous User".to_string(),
            log_level: "info".to_string(),
            debounce_window: Duration::from_millis(250),
            reconnect: ReconnectPolicy::default(),
            http_timeout: Duration::from_millis(5000),
            reconcile_interval: None,
            journal_file: None,
            journal_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration> {
    let ms = std::env::var(key)
        .unwrap_or_else(|_| default_ms.to_string())
        .parse::<u64>()
        .context(format!("Invalid {}", key))?;
    Ok(Duration::from_millis(ms))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        let defaults = Config::default();

        let server_url = std::env::var("SYNC_SERVER_URL").unwrap_or(defaults.server_url);
        url::Url::parse(&server_url).context(format!("Invalid SYNC_SERVER_URL: {}", server_url))?;

        let mut api_base_url = std::env::var("API_BASE_URL").unwrap_or(defaults.api_base_url);
        if !api_base_url.ends_with('/') {
            api_base_url.push('/');
        }
        url::Url::parse(&api_base_url).context(format!("Invalid API_BASE_URL: {}", api_base_url))?;

        let username = std::env::var("SYNC_USERNAME")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.username);

        let log_level = std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level);

        let debounce_window = env_millis("SYNC_DEBOUNCE_MS", 250)?;
        if debounce_window.is_zero() {
            warn!("SYNC_DEBOUNCE_MS is 0; every local keystroke will be sent individually.");
        }

        let initial_delay = env_millis("RECONNECT_INITIAL_DELAY_MS", 1000)?;
        let max_delay = env_millis("RECONNECT_MAX_DELAY_MS", 10_000)?;
        if max_delay < initial_delay {
            anyhow::bail!(
                "RECONNECT_MAX_DELAY_MS ({:?}) must not be below RECONNECT_INITIAL_DELAY_MS ({:?})",
                max_delay,
                initial_delay
            );
        }
        let max_attempts = std::env::var("RECONNECT_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u32>()
            .context("Invalid RECONNECT_MAX_ATTEMPTS")?;

        let http_timeout = env_millis("HTTP_TIMEOUT_MS", 5000)?;

        let reconcile_secs = std::env::var("RECONCILE_INTERVAL_SECS")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u64>()
            .context("Invalid RECONCILE_INTERVAL_SECS")?;

        let journal_file = match std::env::var("SYNC_JOURNAL_FILE") {
            Ok(s) if !s.trim().is_empty() => Some(expand_tilde(s.trim())),
            _ => None,
        };
        let journal_max_size_bytes = std::env::var("SYNC_JOURNAL_MAX_SIZE_MB")
            .unwrap_or_else(|_| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(defaults.journal_max_size_bytes);

        Ok(Config {
            server_url,
            api_base_url,
            username,
            log_level,
            debounce_window,
            reconnect: ReconnectPolicy {
                initial_delay,
                max_delay,
                max_attempts: (max_attempts > 0).then_some(max_attempts),
            },
            http_timeout,
            reconcile_interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
            journal_file,
            journal_max_size_bytes,
        })
    }
}
