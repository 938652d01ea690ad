//! Identity probe
//!
//! Fetches a well-known check page through the Tor SOCKS proxy and extracts
//! the caller's observed address from its body. Any failure along the way
//! (proxy down, timeout, marker missing) observes as `Unknown`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Identity;

/// Probe endpoint configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Page that echoes the caller's address in its body
    pub url: String,
    /// Text immediately preceding the address in the page body
    pub marker: String,
    /// SOCKS proxy the probe request is routed through
    pub socks_proxy: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "https://check.torproject.org".to_string(),
            marker: "Your IP address appears to be: ".to_string(),
            socks_proxy: "socks5h://127.0.0.1:9050".to_string(),
        }
    }
}

/// Source of identity observations
#[async_trait]
pub trait IdentityProbe: Send + Sync {
    /// Observe the currently-effective identity. Never fails; an
    /// undeterminable identity observes as [`Identity::Unknown`].
    async fn observe(&self, timeout: Duration) -> Identity;
}

/// HTTP probe against the configured check page
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    marker: String,
}

impl HttpProbe {
    /// Build a probe client routed through the configured SOCKS proxy
    pub fn new(config: &ProbeConfig) -> reqwest::Result<Self> {
        let proxy = reqwest::Proxy::all(&config.socks_proxy)?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            marker: config.marker.clone(),
        })
    }

    async fn fetch_body(&self) -> reqwest::Result<String> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl IdentityProbe for HttpProbe {
    async fn observe(&self, timeout: Duration) -> Identity {
        match tokio::time::timeout(timeout, self.fetch_body()).await {
            Ok(Ok(body)) => extract_address(&body, &self.marker),
            Ok(Err(e)) => {
                debug!("Identity probe failed: {}", e);
                Identity::Unknown
            }
            Err(_) => {
                debug!("Identity probe timed out after {}ms", timeout.as_millis());
                Identity::Unknown
            }
        }
    }
}

/// Extract the address following `marker` in the page body.
///
/// The address is read as the longest run of address characters (hex digits,
/// dots, colons) after the marker, which covers both IPv4 and IPv6 exits.
pub(crate) fn extract_address(body: &str, marker: &str) -> Identity {
    let Some(start) = body.find(marker).map(|i| i + marker.len()) else {
        return Identity::Unknown;
    };

    let addr: String = body[start..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == '.' || *c == ':')
        .collect();

    if addr.is_empty() {
        Identity::Unknown
    } else {
        Identity::Known(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "Your IP address appears to be: ";

    #[test]
    fn extracts_ipv4_after_marker() {
        let body = format!("<p>Congratulations. {}185.220.101.4</p>", MARKER);
        assert_eq!(
            extract_address(&body, MARKER),
            Identity::known("185.220.101.4")
        );
    }

    #[test]
    fn extracts_ipv6_after_marker() {
        let body = format!("{}2620:7:6001::163 and more text", MARKER);
        assert_eq!(
            extract_address(&body, MARKER),
            Identity::known("2620:7:6001::163")
        );
    }

    #[test]
    fn missing_marker_is_unknown() {
        assert_eq!(
            extract_address("<html>no address here</html>", MARKER),
            Identity::Unknown
        );
    }

    #[test]
    fn marker_with_no_address_is_unknown() {
        let body = format!("{}</p>", MARKER);
        assert_eq!(extract_address(&body, MARKER), Identity::Unknown);
    }
}
