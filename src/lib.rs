//! Torview
//!
//! Tor-routed traffic simulation: drives repeated browser views of a target
//! site, rotating the exit circuit between views so they appear to originate
//! from distinct addresses. The interesting part is the rotation and
//! concurrency core: a serialized control channel, convergence verification,
//! bounded-concurrency admission, per-view retries, and a deduplicated
//! registry of observed identities.

pub mod browser;
pub mod control;
pub mod identity;
pub mod journal;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod visit;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use control::ControlConfig;
use identity::ProbeConfig;
use scheduler::AdmissionPolicy;
use session::RetryConfig;
use visit::VisitConfig;

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Target page every view navigates to
    pub target_url: String,
    /// Total views in the run
    pub views: usize,
    /// Admission bound for batched and bounded-parallel policies
    pub max_concurrent_views: usize,
    /// Admission policy: sequential, batched, or bounded-parallel
    pub policy: AdmissionPolicy,

    /// Attempts per view before giving up
    pub max_retries: u32,
    /// Fixed wait between attempts, in milliseconds
    pub retry_backoff_ms: u64,
    /// Deadline for one rotation acknowledgement
    pub rotation_timeout_ms: u64,
    /// Wait after a rotation acknowledgement before probing
    pub circuit_settle_ms: u64,
    /// Interval between convergence probes
    pub poll_interval_ms: u64,
    /// Deadline for identity convergence after a rotation
    pub converge_timeout_ms: u64,
    /// Deadline for a single identity probe
    pub probe_timeout_ms: u64,

    /// Dwell time on the target page, in milliseconds
    pub dwell_ms: u64,
    /// Interval between scroll actions during the dwell
    pub scroll_interval_ms: u64,
    /// Whether to crawl sub-links discovered on the target page
    pub crawl_enabled: bool,
    /// Upper bound on sub-links visited per view
    pub max_sub_links: usize,
    /// Per-sub-link navigation timeout
    pub sub_link_timeout_ms: u64,
    /// Primary navigation timeout
    pub navigation_timeout_ms: u64,
    /// Path prefixes excluded from sub-link crawling
    pub excluded_path_prefixes: Vec<String>,

    /// Run browsers in headless mode
    pub headless: bool,
    /// Chrome/Chromium executable override
    pub chrome_path: Option<String>,

    /// Tor control endpoint
    pub control: ControlConfig,
    /// Identity probe endpoint
    pub probe: ProbeConfig,

    /// Append-only run journal
    pub journal_file: PathBuf,
    /// Persisted set of unique identities
    pub identity_file: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            views: 10,
            max_concurrent_views: 3,
            policy: AdmissionPolicy::Sequential,
            max_retries: 3,
            retry_backoff_ms: 5000,
            rotation_timeout_ms: 15_000,
            circuit_settle_ms: 5000,
            poll_interval_ms: 2000,
            converge_timeout_ms: 15_000,
            probe_timeout_ms: 10_000,
            dwell_ms: 3000,
            scroll_interval_ms: 2000,
            crawl_enabled: true,
            max_sub_links: 5,
            sub_link_timeout_ms: 30_000,
            navigation_timeout_ms: 30_000,
            excluded_path_prefixes: Vec::new(),
            headless: true,
            chrome_path: None,
            control: ControlConfig::default(),
            probe: ProbeConfig::default(),
            journal_file: PathBuf::from("website_views.log"),
            identity_file: PathBuf::from("unique_ips.log"),
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("torview").join("logs"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("torview").join("config.json"))
    }

    /// Load config from the default location
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Self::default(),
        }
    }

    /// Load config from a specific file, falling back to defaults on error
    pub fn load_from(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to the default location
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }

    /// Retry settings for one view
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            rotation_timeout: Duration::from_millis(self.rotation_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            converge_timeout: Duration::from_millis(self.converge_timeout_ms),
        }
    }

    /// Per-visit browsing settings
    pub fn visit_config(&self) -> VisitConfig {
        VisitConfig {
            dwell_ms: self.dwell_ms,
            scroll_interval_ms: self.scroll_interval_ms,
            crawl_enabled: self.crawl_enabled,
            max_sub_links: self.max_sub_links,
            sub_link_timeout_ms: self.sub_link_timeout_ms,
            navigation_timeout_ms: self.navigation_timeout_ms,
            excluded_path_prefixes: self.excluded_path_prefixes.clone(),
        }
    }
}

/// Initialize logging: console layer plus a daily-rolling file when the log
/// directory is available. The returned guard must be held for the process
/// lifetime.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "torview.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_run_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.views, 10);
        assert_eq!(config.max_concurrent_views, 3);
        assert_eq!(config.policy, AdmissionPolicy::Sequential);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.circuit_settle_ms, 5000);
        assert!(config.crawl_enabled);
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "targetUrl": "https://example.com",
                "views": 4,
                "maxConcurrentViews": 2,
                "policy": "batched"
            }"#,
        )
        .unwrap();

        assert_eq!(config.target_url, "https://example.com");
        assert_eq!(config.views, 4);
        assert_eq!(config.policy, AdmissionPolicy::Batched);
        // Untouched fields come from defaults
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.control.port, 9051);
    }

    #[test]
    fn policy_round_trips_in_kebab_case() {
        let json = serde_json::to_string(&AdmissionPolicy::BoundedParallel).unwrap();
        assert_eq!(json, "\"bounded-parallel\"");
        let parsed: AdmissionPolicy = serde_json::from_str("\"sequential\"").unwrap();
        assert_eq!(parsed, AdmissionPolicy::Sequential);
    }
}
