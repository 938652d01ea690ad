//! Browser session management
//!
//! Handles launching and controlling an individual Chromium instance routed
//! through the Tor SOCKS proxy. Each view gets a fresh session with a
//! randomized viewport and user agent, and releases it when the visit ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::BrowserError;

/// Client signatures presented to the target, chosen uniformly per session
pub const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
];

/// Configuration for a browser session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSessionConfig {
    /// Path to Chrome/Chromium executable (auto-detected when unset)
    pub chrome_path: Option<String>,
    /// Run in headless mode
    pub headless: bool,
    /// User data directory
    pub user_data_dir: Option<String>,
    /// Proxy URL passed to Chromium (e.g. socks5://127.0.0.1:9050)
    pub proxy: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
    /// User agent string
    pub user_agent: String,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            user_data_dir: None,
            proxy: None,
            timeout_secs: 60,
            window_width: 1366,
            window_height: 768,
            user_agent: USER_AGENTS[0].to_string(),
        }
    }
}

impl BrowserSessionConfig {
    /// Create a config with randomized presentation attributes and an
    /// isolated data directory for the labelled session.
    pub fn randomized(label: &str) -> Self {
        let mut rng = rand::thread_rng();

        let user_agent = USER_AGENTS
            .choose(&mut rng)
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();
        let window_width = 1366 + rng.gen_range(0..200);
        let window_height = 768 + rng.gen_range(0..200);

        let data_dir = std::env::temp_dir()
            .join("torview")
            .join("browser_data")
            .join(format!("{}_{}", label, &Uuid::new_v4().to_string()[..8]));

        Self {
            user_data_dir: Some(data_dir.to_string_lossy().to_string()),
            window_width,
            window_height,
            user_agent,
            ..Default::default()
        }
    }

    /// Set headless mode
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Set proxy
    pub fn proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Set Chrome path
    pub fn chrome_path(mut self, path: Option<String>) -> Self {
        self.chrome_path = path;
        self
    }

    /// Set timeout
    pub fn timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// A browser session for one view
pub struct BrowserSession {
    /// Session label (e.g. "view3-a1")
    pub id: String,
    /// The browser instance
    browser: RwLock<Option<Browser>>,
    /// Current active page
    page: RwLock<Option<Page>>,
    /// CDP event handler task; ends when Chromium disconnects
    handler_task: Mutex<Option<JoinHandle<()>>>,
    /// Whether the session is alive
    alive: Arc<AtomicBool>,
    /// Session configuration
    config: BrowserSessionConfig,
}

impl BrowserSession {
    /// Launch a browser and open its initial page
    pub async fn new(id: &str, config: BrowserSessionConfig) -> Result<Self, BrowserError> {
        info!(
            "Launching browser session {} (headless: {}, {}x{})",
            id, config.headless, config.window_width, config.window_height
        );

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(Duration::from_secs(config.timeout_secs))
            .viewport(Viewport {
                width: config.window_width,
                height: config.window_height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: config.window_width >= config.window_height,
                has_touch: false,
            });

        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if let Some(ref dir) = config.user_data_dir {
            std::fs::create_dir_all(dir)?;
            builder = builder.user_data_dir(dir);
        }

        let mut args = vec![
            format!("--user-agent={}", config.user_agent),
            format!(
                "--window-size={},{}",
                config.window_width, config.window_height
            ),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--mute-audio".to_string(),
            "--no-first-run".to_string(),
        ];
        if let Some(ref proxy) = config.proxy {
            args.push(format!("--proxy-server={}", proxy));
        }
        builder = builder.args(args);

        let browser_config = builder
            .build()
            .map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // When the handler stream ends, Chromium has disconnected
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive.clone();
        let id_for_handler = id.to_string();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!("Session {} browser event error: {}", id_for_handler, err);
                }
            }
            debug!("Session {} Chromium disconnected", id_for_handler);
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        Ok(Self {
            id: id.to_string(),
            browser: RwLock::new(Some(browser)),
            page: RwLock::new(Some(page)),
            handler_task: Mutex::new(Some(handler_task)),
            alive,
            config,
        })
    }

    /// Check if the session is alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Session configuration
    pub fn config(&self) -> &BrowserSessionConfig {
        &self.config
    }

    /// Navigate the page and wait for the load to complete
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or_else(|| BrowserError::ConnectionLost("No active page".into()))?;

        debug!("Session {} navigating to: {}", self.id, url);

        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::NavigationFailed)?;

        tokio::time::timeout(timeout, async {
            page.goto(params).await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .map_err(|_| {
            BrowserError::Timeout(format!(
                "Navigation to {} timed out after {}ms",
                url,
                timeout.as_millis()
            ))
        })?
        .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

        Ok(())
    }

    /// Collect the href of every anchor on the page, deduplicated
    pub async fn extract_links(&self) -> Result<Vec<String>, BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or_else(|| BrowserError::ConnectionLost("No active page".into()))?;

        let script = "Array.from(new Set(\
             Array.from(document.querySelectorAll('a'))\
               .map(a => a.href)\
               .filter(href => !!href)))";

        page.evaluate(script)
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?
            .into_value::<Vec<String>>()
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))
    }

    /// Current page title
    pub async fn title(&self) -> Result<String, BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or_else(|| BrowserError::ConnectionLost("No active page".into()))?;

        page.evaluate("document.title")
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?
            .into_value::<String>()
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))
    }

    /// Scroll the page down by the given number of pixels
    pub async fn scroll_by(&self, delta_y: u32) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or_else(|| BrowserError::ConnectionLost("No active page".into()))?;

        page.evaluate(format!("window.scrollBy(0, {})", delta_y))
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
        Ok(())
    }

    /// Close the page, the browser, and the event handler task
    pub async fn close(&self) -> Result<(), BrowserError> {
        self.alive.store(false, Ordering::Relaxed);

        {
            let mut page = self.page.write().await;
            if let Some(p) = page.take() {
                let _ = p.close().await;
            }
        }

        {
            let mut browser = self.browser.write().await;
            if let Some(mut b) = browser.take() {
                if let Err(e) = b.close().await {
                    warn!("Session {} browser did not close cleanly: {}", self.id, e);
                }
            }
        }

        if let Some(handle) = self.handler_task.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("Session {} event handler did not stop within 5s", self.id);
            }
        }

        info!("Browser session {} closed", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randomized_config_stays_within_presentation_bounds() {
        for _ in 0..50 {
            let config = BrowserSessionConfig::randomized("view1-a1");
            assert!((1366..1566).contains(&config.window_width));
            assert!((768..968).contains(&config.window_height));
            assert!(USER_AGENTS.contains(&config.user_agent.as_str()));
        }
    }

    #[test]
    fn randomized_configs_use_distinct_data_dirs() {
        let a = BrowserSessionConfig::randomized("view1-a1");
        let b = BrowserSessionConfig::randomized("view1-a1");
        assert_ne!(a.user_data_dir, b.user_data_dir);
    }
}
