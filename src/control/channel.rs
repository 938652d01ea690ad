//! Single-slot rotation channel
//!
//! All views funnel their circuit rotations through one instance of this
//! channel. A mutex gate admits callers in arrival order, so the control
//! endpoint never sees two in-flight rotation requests, no matter how many
//! views are running.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::client::{ControlTransport, RotationError};

/// Serializes rotation requests against a single control endpoint
pub struct CircuitChannel {
    transport: Arc<dyn ControlTransport>,
    /// Exclusive slot for the in-flight request; queued callers are admitted FIFO
    gate: Mutex<()>,
    /// Observable bookkeeping: requests currently awaiting the endpoint
    in_flight: AtomicUsize,
    /// Successful rotations so far
    rotations: AtomicU64,
    /// How long to wait after an acknowledgement before a probe is meaningful
    /// (circuit establishment is asynchronous to the ack)
    settle: Duration,
}

impl CircuitChannel {
    /// Create a channel over the given transport
    pub fn new(transport: Arc<dyn ControlTransport>, settle: Duration) -> Self {
        Self {
            transport,
            gate: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            rotations: AtomicU64::new(0),
            settle,
        }
    }

    /// Requests currently awaiting the control endpoint (0 or 1)
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Successful rotations so far
    pub fn rotation_count(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Request a new circuit, waiting behind any rotation already in flight.
    ///
    /// On timeout the transport future is dropped (its connection closes with
    /// it) and the slot frees for the next caller; nothing lingers in the
    /// channel's bookkeeping. After a successful acknowledgement the settle
    /// delay elapses *outside* the slot, so waiting callers are not starved
    /// by it.
    pub async fn rotate(&self, timeout: Duration) -> Result<(), RotationError> {
        let result = {
            let _slot = self.gate.lock().await;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            debug!("Rotation slot acquired");

            let result = tokio::time::timeout(timeout, self.transport.signal_newnym()).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        };

        match result {
            Ok(Ok(())) => {
                self.rotations.fetch_add(1, Ordering::Relaxed);
                debug!("Rotation acknowledged, settling {}ms", self.settle.as_millis());
                tokio::time::sleep(self.settle).await;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Rotation failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Rotation timed out after {}ms", timeout.as_millis());
                Err(RotationError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Transport that tracks how many callers await it at once
    struct GaugedTransport {
        current: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl GaugedTransport {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ControlTransport for GaugedTransport {
        async fn signal_newnym(&self) -> Result<(), RotationError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTransport(fn() -> RotationError);

    #[async_trait]
    impl ControlTransport for FailingTransport {
        async fn signal_newnym(&self) -> Result<(), RotationError> {
            Err((self.0)())
        }
    }

    #[tokio::test]
    async fn concurrent_rotations_are_serialized() {
        let transport = Arc::new(GaugedTransport::new(Duration::from_millis(10)));
        let channel = Arc::new(CircuitChannel::new(transport.clone(), Duration::ZERO));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                channel.rotate(Duration::from_secs(5)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.rotation_count(), 8);
    }

    #[tokio::test]
    async fn slow_transport_times_out() {
        let transport = Arc::new(GaugedTransport::new(Duration::from_secs(10)));
        let channel = CircuitChannel::new(transport, Duration::ZERO);

        let err = channel.rotate(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, RotationError::Timeout(20)));
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.rotation_count(), 0);
    }

    #[tokio::test]
    async fn slot_frees_after_timeout() {
        let slow = Arc::new(GaugedTransport::new(Duration::from_secs(10)));
        let channel = Arc::new(CircuitChannel::new(slow, Duration::ZERO));

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.rotate(Duration::from_millis(10)).await })
        };
        assert!(first.await.unwrap().is_err());

        // The slot must be reusable; a second timed-out call proves no caller
        // is left permanently queued behind an abandoned request.
        assert!(channel.rotate(Duration::from_millis(10)).await.is_err());
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn rejection_passes_through() {
        let transport = Arc::new(FailingTransport(|| {
            RotationError::Rejected("515 Authentication failed".into())
        }));
        let channel = CircuitChannel::new(transport, Duration::ZERO);

        let err = channel.rotate(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
