//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! Bounded-capacity gate over outstanding dispatches.
//!
//! Capacity units are taken by the producer and handed back by completion
//! callbacks, which may run on any thread and race with the next acquisition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sfeed_messaging::CompletionHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{ReplayError, Result};

#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    outstanding: AtomicUsize,
    peak: AtomicUsize,
}

/// Limits how many dispatches may await completion at once.
#[derive(Debug, Clone)]
pub struct BackpressureGate {
    inner: Arc<GateInner>,
}

/// One reserved unit of gate capacity, returned when dropped.
#[derive(Debug)]
pub struct GatePermit {
    inner: Arc<GateInner>,
    _permit: OwnedSemaphorePermit,
}

impl BackpressureGate {
    /// Create a gate; capacity is clamped to at least one unit.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize).min(Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                outstanding: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free unit and hold it until the permit is released.
    pub async fn reserve(&self) -> Result<GatePermit> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ReplayError::GateClosed)?;
        let outstanding = self.inner.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(outstanding, Ordering::SeqCst);
        Ok(GatePermit {
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Wait for a free unit, then return it once `completion` resolves.
    ///
    /// Success and failure both release the unit.
    pub async fn acquire(&self, completion: &CompletionHandle) -> Result<()> {
        self.reserve().await?.release_on(completion);
        Ok(())
    }

    /// Wait until no dispatch is outstanding.
    pub async fn drain(&self) -> Result<()> {
        let _all = self
            .inner
            .semaphore
            .acquire_many(self.inner.capacity as u32)
            .await
            .map_err(|_| ReplayError::GateClosed)?;
        Ok(())
    }

    /// Refuse further reservations and wake any waiter with an error.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Units currently held.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Highest number of units held at once.
    pub fn peak_outstanding(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

impl GatePermit {
    /// Release this unit when `completion` resolves.
    pub fn release_on(self, completion: &CompletionHandle) {
        completion.on_complete(move |_| drop(self));
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        // The semaphore unit is returned after this, when `_permit` drops.
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
