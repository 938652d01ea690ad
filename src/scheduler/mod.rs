//! Traffic scheduler
//!
//! Admits views under a configurable admission policy, collects their
//! outcomes in submission order, and aggregates successful identities into
//! the registry. A fatal abort raised by any view stops further admissions;
//! views already in flight finish naturally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};
use url::Url;

use crate::identity::IdentityRegistry;
use crate::session::{FailureReason, RetryingSession, SessionOutcome};
use crate::stats::RunStats;
use crate::visit::VisitConfig;

/// How views are admitted into the running state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    /// One view at a time
    Sequential,
    /// Fixed-size batches, each fully awaited before the next
    Batched,
    /// Up to the bound in flight, a new view admitted as soon as a slot frees
    BoundedParallel,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::Sequential
    }
}

/// Runs all views of a run under the configured admission policy
pub struct TrafficScheduler {
    session: Arc<RetryingSession>,
    visit: VisitConfig,
    policy: AdmissionPolicy,
    max_concurrent_views: usize,
    /// Run-level abort flag, shared with every view
    cancelled: Arc<AtomicBool>,
    /// Single-writer identity aggregation; only the scheduler records
    registry: Arc<Mutex<IdentityRegistry>>,
    stats: Arc<RunStats>,
}

impl TrafficScheduler {
    pub fn new(
        session: Arc<RetryingSession>,
        visit: VisitConfig,
        policy: AdmissionPolicy,
        max_concurrent_views: usize,
        cancelled: Arc<AtomicBool>,
        registry: Arc<Mutex<IdentityRegistry>>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            session,
            visit,
            policy,
            max_concurrent_views: max_concurrent_views.max(1),
            cancelled,
            registry,
            stats,
        }
    }

    /// Run `views` views against `url`. The returned outcomes are ordered by
    /// submission index regardless of completion order.
    pub async fn run_all(&self, url: &Url, views: usize) -> Vec<SessionOutcome> {
        info!(
            "Running {} views ({:?} admission, bound {})",
            views, self.policy, self.max_concurrent_views
        );

        let outcomes = match self.policy {
            AdmissionPolicy::Sequential => self.run_sequential(url, views).await,
            AdmissionPolicy::Batched => self.run_batched(url, views).await,
            AdmissionPolicy::BoundedParallel => self.run_bounded(url, views).await,
        };

        let mut registry = self.registry.lock().await;
        for outcome in &outcomes {
            if let Some(identity) = outcome.identity() {
                registry.record(identity);
            }
        }

        info!(
            "Run finished: {} views, {} unique identities, peak concurrency {}",
            outcomes.len(),
            registry.len(),
            self.stats.peak_views()
        );
        outcomes
    }

    /// Run one view with in-flight accounting
    async fn run_view(&self, url: &Url, view_index: usize) -> SessionOutcome {
        self.stats.view_started();
        let outcome = self.session.run(url, view_index, &self.visit).await;
        self.stats.view_finished();

        if let SessionOutcome::Failure {
            reason: FailureReason::Rejected,
            ..
        } = outcome
        {
            warn!("View #{} raised a fatal abort; halting admissions", view_index);
        }
        outcome
    }

    fn dropped(view_index: usize) -> SessionOutcome {
        info!("View #{} dropped: run aborted before it started", view_index);
        SessionOutcome::Failure {
            reason: FailureReason::Cancelled,
            attempts: 0,
        }
    }

    async fn run_sequential(&self, url: &Url, views: usize) -> Vec<SessionOutcome> {
        let mut outcomes = Vec::with_capacity(views);
        for view_index in 1..=views {
            if self.cancelled.load(Ordering::SeqCst) {
                outcomes.push(Self::dropped(view_index));
                continue;
            }
            outcomes.push(self.run_view(url, view_index).await);
        }
        outcomes
    }

    async fn run_batched(&self, url: &Url, views: usize) -> Vec<SessionOutcome> {
        let indices: Vec<usize> = (1..=views).collect();
        let mut outcomes = Vec::with_capacity(views);

        for batch in indices.chunks(self.max_concurrent_views) {
            if self.cancelled.load(Ordering::SeqCst) {
                outcomes.extend(batch.iter().map(|&i| Self::dropped(i)));
                continue;
            }

            let tasks: Vec<_> = batch
                .iter()
                .map(|&view_index| {
                    let scheduler = self.clone_handles();
                    let url = url.clone();
                    tokio::spawn(async move { scheduler.run_view(&url, view_index).await })
                })
                .collect();

            for (offset, task) in tasks.into_iter().enumerate() {
                match task.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        warn!("View #{} task panicked: {}", batch[offset], e);
                        outcomes.push(SessionOutcome::Failure {
                            reason: FailureReason::Cancelled,
                            attempts: 0,
                        });
                    }
                }
            }
        }
        outcomes
    }

    async fn run_bounded(&self, url: &Url, views: usize) -> Vec<SessionOutcome> {
        let slots = Arc::new(Semaphore::new(self.max_concurrent_views));

        let tasks: Vec<_> = (1..=views)
            .map(|view_index| {
                let scheduler = self.clone_handles();
                let url = url.clone();
                let slots = slots.clone();
                tokio::spawn(async move {
                    let _permit = match slots.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return Self::dropped(view_index),
                    };
                    if scheduler.cancelled.load(Ordering::SeqCst) {
                        return Self::dropped(view_index);
                    }
                    scheduler.run_view(&url, view_index).await
                })
            })
            .collect();

        join_all(tasks)
            .await
            .into_iter()
            .enumerate()
            .map(|(i, joined)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("View #{} task panicked: {}", i + 1, e);
                    SessionOutcome::Failure {
                        reason: FailureReason::Cancelled,
                        attempts: 0,
                    }
                }
            })
            .collect()
    }

    /// Cheap clone of the shared handles for spawned view tasks
    fn clone_handles(&self) -> TrafficScheduler {
        TrafficScheduler {
            session: self.session.clone(),
            visit: self.visit.clone(),
            policy: self.policy,
            max_concurrent_views: self.max_concurrent_views,
            cancelled: self.cancelled.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserError;
    use crate::control::{ControlTransport, RotationError};
    use crate::identity::{Identity, IdentityProbe};
    use crate::session::testing::{test_session, FakeTransport, FixedProbe, SequenceProbe};
    use crate::session::SessionAttempt;
    use crate::visit::{PageVisitor, VisitReport};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Visitor that records start/end events per view and dwells briefly
    struct EventVisitor {
        events: StdMutex<Vec<(String, usize)>>,
        dwell: Duration,
    }

    impl EventVisitor {
        fn new(dwell: Duration) -> Self {
            Self {
                events: StdMutex::new(Vec::new()),
                dwell,
            }
        }

        fn events(&self) -> Vec<(String, usize)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageVisitor for EventVisitor {
        async fn visit(
            &self,
            _url: &Url,
            attempt: &SessionAttempt,
            _config: &VisitConfig,
        ) -> Result<VisitReport, BrowserError> {
            self.events
                .lock()
                .unwrap()
                .push(("start".into(), attempt.view_index));
            tokio::time::sleep(self.dwell).await;
            self.events
                .lock()
                .unwrap()
                .push(("end".into(), attempt.view_index));
            Ok(VisitReport::default())
        }
    }

    struct Harness {
        scheduler: TrafficScheduler,
        registry: Arc<Mutex<IdentityRegistry>>,
        stats: Arc<RunStats>,
        visitor: Arc<EventVisitor>,
    }

    fn harness(
        policy: AdmissionPolicy,
        bound: usize,
        transport: Arc<dyn ControlTransport>,
        probe: Arc<dyn IdentityProbe>,
    ) -> Harness {
        let cancelled = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RunStats::new());
        let visitor = Arc::new(EventVisitor::new(Duration::from_millis(20)));
        let session = Arc::new(test_session(
            transport,
            probe,
            visitor.clone(),
            cancelled.clone(),
            stats.clone(),
        ));
        let registry = Arc::new(Mutex::new(IdentityRegistry::new()));
        let scheduler = TrafficScheduler::new(
            session,
            VisitConfig::default(),
            policy,
            bound,
            cancelled,
            registry.clone(),
            stats.clone(),
        );
        Harness {
            scheduler,
            registry,
            stats,
            visitor,
        }
    }

    fn url() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    #[tokio::test]
    async fn sequential_runs_one_view_at_a_time() {
        let h = harness(
            AdmissionPolicy::Sequential,
            1,
            Arc::new(FakeTransport(|| Ok(()))),
            Arc::new(SequenceProbe::default()),
        );

        let outcomes = h.scheduler.run_all(&url(), 3).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert_eq!(h.stats.peak_views(), 1);
        assert_eq!(h.registry.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn batched_awaits_each_batch_before_the_next() {
        let h = harness(
            AdmissionPolicy::Batched,
            2,
            Arc::new(FakeTransport(|| Ok(()))),
            Arc::new(SequenceProbe::default()),
        );

        let outcomes = h.scheduler.run_all(&url(), 4).await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert!(h.stats.peak_views() <= 2);

        // Both views of batch 1 must end before any view of batch 2 starts
        let events = h.visitor.events();
        let batch1_last_end = events
            .iter()
            .rposition(|(kind, view)| kind == "end" && (*view == 1 || *view == 2))
            .unwrap();
        let batch2_first_start = events
            .iter()
            .position(|(kind, view)| kind == "start" && (*view == 3 || *view == 4))
            .unwrap();
        assert!(batch1_last_end < batch2_first_start);
    }

    #[tokio::test]
    async fn bounded_parallel_respects_the_admission_bound() {
        let h = harness(
            AdmissionPolicy::BoundedParallel,
            2,
            Arc::new(FakeTransport(|| Ok(()))),
            Arc::new(SequenceProbe::default()),
        );

        let outcomes = h.scheduler.run_all(&url(), 6).await;

        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert!(h.stats.peak_views() <= 2);
        // Every view browsed under a distinct identity
        assert_eq!(h.registry.lock().await.len(), 6);
    }

    #[tokio::test]
    async fn fatal_rejection_aborts_and_persists_nothing() {
        let h = harness(
            AdmissionPolicy::Sequential,
            1,
            Arc::new(FakeTransport(|| {
                Err(RotationError::Rejected("515 Authentication failed".into()))
            })),
            Arc::new(SequenceProbe::default()),
        );

        let outcomes = h.scheduler.run_all(&url(), 3).await;

        assert!(matches!(
            outcomes[0],
            SessionOutcome::Failure {
                reason: FailureReason::Rejected,
                attempts: 1,
            }
        ));
        for outcome in &outcomes[1..] {
            assert!(matches!(
                outcome,
                SessionOutcome::Failure {
                    reason: FailureReason::Cancelled,
                    attempts: 0,
                }
            ));
        }
        assert!(h.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_identity_exhausts_every_view() {
        let h = harness(
            AdmissionPolicy::Sequential,
            1,
            Arc::new(FakeTransport(|| Ok(()))),
            Arc::new(FixedProbe(Identity::Unknown)),
        );

        let outcomes = h.scheduler.run_all(&url(), 2).await;

        for outcome in &outcomes {
            assert!(matches!(
                outcome,
                SessionOutcome::Failure {
                    reason: FailureReason::Exhausted,
                    attempts: 3,
                }
            ));
        }
        assert!(h.visitor.events().is_empty());
        assert!(h.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn outcomes_are_ordered_by_submission_index() {
        let h = harness(
            AdmissionPolicy::BoundedParallel,
            3,
            Arc::new(FakeTransport(|| Ok(()))),
            Arc::new(SequenceProbe::default()),
        );

        let outcomes = h.scheduler.run_all(&url(), 5).await;

        // Start events carry the submission index; outcomes line up with it
        let started: Vec<usize> = h
            .visitor
            .events()
            .iter()
            .filter(|(kind, _)| kind == "start")
            .map(|(_, view)| *view)
            .collect();
        let mut sorted = started.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
        assert_eq!(outcomes.len(), 5);
    }
}
