//! Convergence detection
//!
//! A rotation acknowledgement alone does not guarantee the identity actually
//! changed; convergence must be observed. The verifier polls the probe at a
//! fixed interval until the observation differs from a previous one, bounded
//! by an overall deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{Identity, IdentityProbe};

/// Observes the effective identity and waits for it to change
pub struct IdentityVerifier {
    probe: Arc<dyn IdentityProbe>,
    probe_timeout: Duration,
}

impl IdentityVerifier {
    /// Create a verifier over the given probe
    pub fn new(probe: Arc<dyn IdentityProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
        }
    }

    /// One observation of the currently-effective identity
    pub async fn current_identity(&self) -> Identity {
        self.probe.observe(self.probe_timeout).await
    }

    /// Poll until the observed identity is known and differs from
    /// `previous`, or until `overall_timeout` elapses.
    ///
    /// On deadline the last observation is returned as-is, which may still
    /// equal `previous` or be `Unknown`; the caller decides what an
    /// unchanged identity means. Before the deadline an unchanged value is
    /// never returned.
    pub async fn wait_for_change(
        &self,
        previous: &Identity,
        poll_interval: Duration,
        overall_timeout: Duration,
    ) -> Identity {
        let deadline = Instant::now() + overall_timeout;
        let mut last = self.current_identity().await;

        loop {
            if !last.is_unknown() && last != *previous {
                return last;
            }
            if Instant::now() >= deadline {
                debug!(
                    "Identity did not converge within {}ms (last observed: {})",
                    overall_timeout.as_millis(),
                    last
                );
                return last;
            }

            tokio::time::sleep(poll_interval).await;
            last = self.current_identity().await;
        }
    }
}
