//! Single-view browsing
//!
//! Runs one end-to-end visit under a fixed identity: navigate to the target,
//! optionally crawl a bounded random subset of same-origin links, dwell with
//! incremental scrolling, then release the browser.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::browser::{BrowserError, BrowserSession, BrowserSessionConfig};
use crate::journal::Journal;
use crate::session::SessionAttempt;

/// Per-visit behavior configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitConfig {
    /// How long to stay on the target page, in milliseconds (plus jitter)
    pub dwell_ms: u64,
    /// Interval between scroll actions during the dwell
    pub scroll_interval_ms: u64,
    /// Whether to visit sub-links discovered on the target page
    pub crawl_enabled: bool,
    /// Upper bound on sub-links visited per view
    pub max_sub_links: usize,
    /// Per-sub-link navigation timeout
    pub sub_link_timeout_ms: u64,
    /// Primary navigation timeout
    pub navigation_timeout_ms: u64,
    /// Path prefixes excluded from sub-link crawling
    pub excluded_path_prefixes: Vec<String>,
}

impl Default for VisitConfig {
    fn default() -> Self {
        Self {
            dwell_ms: 3000,
            scroll_interval_ms: 2000,
            crawl_enabled: true,
            max_sub_links: 5,
            sub_link_timeout_ms: 30_000,
            navigation_timeout_ms: 30_000,
            excluded_path_prefixes: Vec::new(),
        }
    }
}

/// A sub-page that was actually visited
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitedPage {
    pub url: String,
    pub title: String,
}

/// What one visit did, for diagnostic logging
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitReport {
    /// Sub-links visited, in visit order
    pub sub_links: Vec<VisitedPage>,
    /// Sub-links that failed to load and were skipped
    pub skipped_links: usize,
}

/// Performs one browsing session under a fixed identity
#[async_trait]
pub trait PageVisitor: Send + Sync {
    async fn visit(
        &self,
        url: &Url,
        attempt: &SessionAttempt,
        config: &VisitConfig,
    ) -> Result<VisitReport, BrowserError>;
}

/// Select the sub-links to crawl: same-origin, not under an excluded path
/// prefix, no fragments or script pseudo-links, deduplicated, uniformly
/// shuffled, at most `max` of them.
pub fn select_sub_links(base: &Url, hrefs: &[String], excluded: &[String], max: usize) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for href in hrefs {
        if href.contains('#') || href.starts_with("javascript:") {
            continue;
        }
        let Ok(candidate) = base.join(href) else {
            continue;
        };
        if candidate.origin() != base.origin() {
            continue;
        }
        if excluded
            .iter()
            .any(|prefix| candidate.path().starts_with(prefix.as_str()))
        {
            continue;
        }
        if seen.insert(candidate.as_str().to_string()) {
            candidates.push(candidate);
        }
    }

    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(max);
    candidates
}

/// Visitor backed by a real browser session per attempt
pub struct BrowserVisitor {
    /// SOCKS proxy every session is routed through
    proxy: Option<String>,
    headless: bool,
    chrome_path: Option<String>,
    journal: Arc<Journal>,
}

impl BrowserVisitor {
    pub fn new(
        proxy: Option<String>,
        headless: bool,
        chrome_path: Option<String>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            proxy,
            headless,
            chrome_path,
            journal,
        }
    }

    async fn visit_sub_link(
        &self,
        session: &BrowserSession,
        link: &Url,
        config: &VisitConfig,
    ) -> Result<VisitedPage, BrowserError> {
        session
            .navigate(
                link.as_str(),
                Duration::from_millis(config.sub_link_timeout_ms),
            )
            .await?;

        let title = session.title().await.unwrap_or_default();

        let scroll = rand::thread_rng().gen_range(0..500);
        let _ = session.scroll_by(scroll).await;

        let pause = rand::thread_rng().gen_range(0..2000);
        tokio::time::sleep(Duration::from_millis(pause)).await;

        Ok(VisitedPage {
            url: link.as_str().to_string(),
            title,
        })
    }

    /// Dwell on the current page, scrolling a random increment per tick
    async fn dwell(&self, session: &BrowserSession, config: &VisitConfig) {
        let jitter: u64 = rand::thread_rng().gen_range(0..1000);
        let deadline = Instant::now() + Duration::from_millis(config.dwell_ms + jitter);

        while Instant::now() < deadline {
            let scroll = rand::thread_rng().gen_range(0..500);
            if let Err(e) = session.scroll_by(scroll).await {
                debug!("Session {} scroll failed: {}", session.id, e);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(Duration::from_millis(config.scroll_interval_ms)))
                .await;
        }
    }

    async fn run_visit(
        &self,
        session: &BrowserSession,
        url: &Url,
        config: &VisitConfig,
    ) -> Result<VisitReport, BrowserError> {
        // The primary navigation is fatal for the attempt
        session
            .navigate(
                url.as_str(),
                Duration::from_millis(config.navigation_timeout_ms),
            )
            .await?;

        let mut report = VisitReport::default();

        if config.crawl_enabled && config.max_sub_links > 0 {
            let hrefs = match session.extract_links().await {
                Ok(hrefs) => hrefs,
                Err(e) => {
                    warn!("Session {} link extraction failed: {}", session.id, e);
                    Vec::new()
                }
            };

            let picks = select_sub_links(
                url,
                &hrefs,
                &config.excluded_path_prefixes,
                config.max_sub_links,
            );
            debug!(
                "Session {} crawling {} of {} candidate links",
                session.id,
                picks.len(),
                hrefs.len()
            );

            for link in &picks {
                match self.visit_sub_link(session, link, config).await {
                    Ok(page) => {
                        self.journal
                            .log(format!(
                                "  - Navigated to sub-page: {} - Title: {}",
                                page.url, page.title
                            ))
                            .await;
                        report.sub_links.push(page);
                    }
                    Err(e) => {
                        // Non-fatal: record and move on to the next link
                        self.journal
                            .log(format!("  - Error navigating sub-page: {} - {}", link, e))
                            .await;
                        report.skipped_links += 1;
                    }
                }
            }
        }

        self.dwell(session, config).await;

        Ok(report)
    }
}

#[async_trait]
impl PageVisitor for BrowserVisitor {
    async fn visit(
        &self,
        url: &Url,
        attempt: &SessionAttempt,
        config: &VisitConfig,
    ) -> Result<VisitReport, BrowserError> {
        let label = format!("view{}-a{}", attempt.view_index, attempt.attempt);
        let session_config = BrowserSessionConfig::randomized(&label)
            .headless(self.headless)
            .proxy(self.proxy.clone())
            .chrome_path(self.chrome_path.clone());

        let session = BrowserSession::new(&label, session_config).await?;
        let result = self.run_visit(&session, url, config).await;

        // Release resources whether the visit succeeded or not
        if let Err(e) = session.close().await {
            warn!("Session {} close failed: {}", label, e);
        }

        result
    }
}
