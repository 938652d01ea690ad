//! Per-view retry machinery
//!
//! Each view runs the same cycle: rotate the circuit, wait for the identity
//! to actually change, then browse under the new identity. Any retryable
//! failure consumes an attempt and restarts the cycle after a backoff; a
//! control-endpoint rejection aborts the whole run. Nothing from a failed
//! attempt survives except the previously observed identity, which the next
//! attempt must rotate away from.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};
use url::Url;

use crate::control::CircuitChannel;
use crate::identity::{Identity, IdentityVerifier};
use crate::journal::Journal;
use crate::stats::RunStats;
use crate::visit::{PageVisitor, VisitConfig, VisitReport};

/// One try of one view
#[derive(Debug, Clone)]
pub struct SessionAttempt {
    /// 1-based index of the view within the run
    pub view_index: usize,
    /// 1-based attempt counter
    pub attempt: u32,
    pub max_attempts: u32,
    /// Identity observed by the previous attempt (`Unknown` on the first)
    pub prior_identity: Identity,
}

/// Why a view failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// All attempts consumed
    Exhausted,
    /// Dropped or stopped by a run-level abort
    Cancelled,
    /// This view hit the fatal control-endpoint rejection
    Rejected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Exhausted => f.write_str("retries exhausted"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Rejected => f.write_str("control endpoint rejected rotation"),
        }
    }
}

/// The result of one view
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Success {
        identity: Identity,
        report: VisitReport,
    },
    Failure {
        reason: FailureReason,
        attempts: u32,
    },
}

impl SessionOutcome {
    /// The identity the view browsed under, if it succeeded
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionOutcome::Success { identity, .. } => Some(identity),
            SessionOutcome::Failure { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Success { .. })
    }
}

/// Retry behavior for one view
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per view before giving up
    pub max_attempts: u32,
    /// Fixed wait between attempts
    pub backoff: Duration,
    /// Deadline for one rotation acknowledgement
    pub rotation_timeout: Duration,
    /// Interval between convergence probes
    pub poll_interval: Duration,
    /// Deadline for identity convergence after a rotation
    pub converge_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(5000),
            rotation_timeout: Duration::from_millis(15_000),
            poll_interval: Duration::from_millis(2000),
            converge_timeout: Duration::from_millis(15_000),
        }
    }
}

/// Runs one view to completion with bounded retries and a fresh circuit per
/// attempt.
pub struct RetryingSession {
    channel: Arc<CircuitChannel>,
    verifier: Arc<IdentityVerifier>,
    visitor: Arc<dyn PageVisitor>,
    journal: Arc<Journal>,
    config: RetryConfig,
    /// Run-level abort flag, shared with the scheduler
    cancelled: Arc<AtomicBool>,
    stats: Arc<RunStats>,
}

impl RetryingSession {
    pub fn new(
        channel: Arc<CircuitChannel>,
        verifier: Arc<IdentityVerifier>,
        visitor: Arc<dyn PageVisitor>,
        journal: Arc<Journal>,
        config: RetryConfig,
        cancelled: Arc<AtomicBool>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            channel,
            verifier,
            visitor,
            journal,
            config,
            cancelled,
            stats,
        }
    }

    /// Run one view to a terminal outcome
    pub async fn run(&self, url: &Url, view_index: usize, visit: &VisitConfig) -> SessionOutcome {
        let mut prior = Identity::Unknown;
        let mut attempt_no: u32 = 0;

        loop {
            attempt_no += 1;
            let attempt = SessionAttempt {
                view_index,
                attempt: attempt_no,
                max_attempts: self.config.max_attempts,
                prior_identity: prior.clone(),
            };

            // Rotating
            self.journal
                .log(format!(
                    "View #{}, attempt {} - Requesting new circuit...",
                    view_index, attempt_no
                ))
                .await;
            self.stats.record_rotation_request();

            match self.channel.rotate(self.config.rotation_timeout).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    self.stats.record_rotation_failure();
                    error!("View #{} aborting run: {}", view_index, e);
                    self.journal
                        .log(format!("View #{} - Aborting run: {}", view_index, e))
                        .await;
                    self.cancelled.store(true, Ordering::SeqCst);
                    return self.fail(FailureReason::Rejected, attempt_no);
                }
                Err(e) => {
                    self.stats.record_rotation_failure();
                    self.journal
                        .log(format!(
                            "View #{}, attempt {} failed: {}",
                            view_index, attempt_no, e
                        ))
                        .await;
                    match self.next_attempt(attempt_no).await {
                        Some(reason) => return self.fail(reason, attempt_no),
                        None => continue,
                    }
                }
            }

            // Verifying: the acknowledgement alone proves nothing, the
            // identity change has to be observed.
            let observed = self
                .verifier
                .wait_for_change(&prior, self.config.poll_interval, self.config.converge_timeout)
                .await;
            self.journal
                .log(format!(
                    "View #{}, attempt {} - Current IP: {}",
                    view_index, attempt_no, observed
                ))
                .await;

            if observed.is_unknown() || observed == prior {
                // A rotation with no observable effect must not be used to
                // browse under the old identity.
                warn!(
                    "View #{} identity unchanged after rotation (observed: {})",
                    view_index, observed
                );
                self.journal
                    .log(format!(
                        "View #{}, attempt {} failed: identity did not change after rotation",
                        view_index, attempt_no
                    ))
                    .await;
                match self.next_attempt(attempt_no).await {
                    Some(reason) => return self.fail(reason, attempt_no),
                    None => continue,
                }
            }

            // Browsing
            match self.visitor.visit(url, &attempt, visit).await {
                Ok(report) => {
                    self.journal
                        .log(format!(
                            "View #{} - Visited {} with IP {} ({} sub-links, {} skipped)",
                            view_index,
                            url,
                            observed,
                            report.sub_links.len(),
                            report.skipped_links
                        ))
                        .await;
                    self.stats.record_view_success();
                    return SessionOutcome::Success {
                        identity: observed,
                        report,
                    };
                }
                Err(e) => {
                    self.journal
                        .log(format!(
                            "View #{}, attempt {} failed: {}",
                            view_index, attempt_no, e
                        ))
                        .await;
                    // The circuit was consumed; the next attempt must rotate
                    // away from what this one observed.
                    prior = observed;
                    match self.next_attempt(attempt_no).await {
                        Some(reason) => return self.fail(reason, attempt_no),
                        None => continue,
                    }
                }
            }
        }
    }

    /// Decide whether another attempt happens. `None` means retry after the
    /// backoff; `Some(reason)` ends the view.
    async fn next_attempt(&self, attempt: u32) -> Option<FailureReason> {
        if attempt >= self.config.max_attempts {
            return Some(FailureReason::Exhausted);
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Some(FailureReason::Cancelled);
        }
        sleep(self.config.backoff).await;
        if self.cancelled.load(Ordering::SeqCst) {
            return Some(FailureReason::Cancelled);
        }
        None
    }

    fn fail(&self, reason: FailureReason, attempts: u32) -> SessionOutcome {
        self.stats.record_view_failure();
        SessionOutcome::Failure { reason, attempts }
    }
}
