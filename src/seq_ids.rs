// src/seq_ids.rs - Bounded pool of sequence ids shared by concurrent sessions
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::SegQueue;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::error::{NativeError, Result};
use crate::types::SequenceId;

/// Hands out ids `0..capacity` and recycles them.
///
/// The semaphore counts free ids and the lock-free queue holds them. A permit is only
/// consumed (forgotten) once an id has actually been taken from the queue; any other exit
/// drops the permit, which hands it back.
#[derive(Debug)]
pub struct SequenceIdAllocator {
    gate: Semaphore,
    free: SegQueue<SequenceId>,
    /// One flag per id, set while the id is lent out
    held: Box<[AtomicBool]>,
    counters: AllocatorCounters,
}

#[derive(Debug, Default)]
struct AllocatorCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    rejected_releases: AtomicU64,
}

/// Snapshot of allocator activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub capacity: usize,
    pub available: usize,
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub rejected_releases: u64,
}

impl SequenceIdAllocator {
    /// Create a pool of `max(max_count, 1)` ids
    pub fn new(max_count: usize) -> Self {
        let capacity = max_count.clamp(1, i32::MAX as usize).min(Semaphore::MAX_PERMITS);
        if capacity != max_count {
            log::warn!("Sequence pool size {} adjusted to {}", max_count, capacity);
        }

        let free = SegQueue::new();
        for id in 0..capacity {
            free.push(SequenceId(id as i32));
        }

        Self {
            gate: Semaphore::new(capacity),
            free,
            held: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            counters: AllocatorCounters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.held.len()
    }

    /// Ids free right now (racy by nature, for monitoring)
    pub fn available(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn outstanding(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    /// Wait for a free id.
    ///
    /// Suspends without blocking the thread. `timeout` bounds the wait and fails with
    /// [`NativeError::PoolExhaustedTimeout`]; a fired `cancel` token fails with
    /// [`NativeError::Cancelled`]. Cancellation wins if both are ready.
    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<SequenceId> {
        let permit = self.wait_for_permit(timeout, cancel).await?;
        self.take_id(permit)
    }

    /// Take a free id without waiting
    pub fn try_acquire(&self) -> Result<SequenceId> {
        match self.gate.try_acquire() {
            Ok(permit) => self.take_id(permit),
            Err(_) => Err(NativeError::PoolExhausted),
        }
    }

    /// Like [`SequenceIdAllocator::acquire`], but the id comes back automatically when the
    /// returned lease is dropped.
    pub async fn lease(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<SequenceLease> {
        let id = self.acquire(timeout, cancel).await?;
        Ok(SequenceLease {
            pool: Arc::clone(self),
            id,
            active: true,
        })
    }

    /// Return an id to the pool.
    ///
    /// Ids that are out of range or not currently lent out are rejected with
    /// [`NativeError::SequenceNotHeld`] and the pool is left as it was.
    pub fn release(&self, id: SequenceId) -> Result<()> {
        let slot = usize::try_from(id.0)
            .ok()
            .and_then(|index| self.held.get(index));
        let slot = match slot {
            Some(slot) => slot,
            None => return Err(self.reject_release(id, "out of range")),
        };

        if !slot.swap(false, Ordering::AcqRel) {
            return Err(self.reject_release(id, "not currently held"));
        }

        // Queue first, then permit: a waiter woken by the permit must find the id.
        self.free.push(id);
        self.gate.add_permits(1);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        log::trace!("Released {}", id);
        Ok(())
    }

    pub fn is_held(&self, id: SequenceId) -> bool {
        usize::try_from(id.0)
            .ok()
            .and_then(|index| self.held.get(index))
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            capacity: self.capacity(),
            available: self.available(),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            rejected_releases: self.counters.rejected_releases.load(Ordering::Relaxed),
        }
    }

    async fn wait_for_permit(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<SemaphorePermit<'_>> {
        let wait = async {
            let acquired = match timeout {
                Some(limit) => match tokio::time::timeout(limit, self.gate.acquire()).await {
                    Ok(acquired) => acquired,
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        log::debug!("Timed out after {:?} waiting for a sequence id", limit);
                        return Err(NativeError::PoolExhaustedTimeout);
                    }
                },
                None => self.gate.acquire().await,
            };
            // The gate is never closed, so this only fires if that invariant breaks
            acquired.map_err(|_| NativeError::PoolExhausted)
        };

        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Sequence id acquire cancelled");
                    Err(NativeError::Cancelled)
                }
                outcome = wait => outcome,
            },
            None => wait.await,
        }
    }

    fn take_id(&self, permit: SemaphorePermit<'_>) -> Result<SequenceId> {
        match self.free.pop() {
            Some(id) => {
                permit.forget();
                if self.held[id.0 as usize].swap(true, Ordering::AcqRel) {
                    log::error!("{} handed out while already held", id);
                }
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                log::trace!("Acquired {}", id);
                Ok(id)
            }
            None => {
                // Dropping the permit gives it back
                log::error!("Sequence pool gate admitted a caller but no id was queued");
                drop(permit);
                Err(NativeError::PoolExhausted)
            }
        }
    }

    fn reject_release(&self, id: SequenceId, reason: &str) -> NativeError {
        self.counters.rejected_releases.fetch_add(1, Ordering::Relaxed);
        log::warn!("Rejected release of {}: {}", id, reason);
        NativeError::SequenceNotHeld(id)
    }
}

/// A sequence id that returns itself to its pool when dropped
#[derive(Debug)]
pub struct SequenceLease {
    pool: Arc<SequenceIdAllocator>,
    id: SequenceId,
    active: bool,
}

impl SequenceLease {
    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// Stop tracking the id; the caller becomes responsible for releasing it
    pub fn detach(mut self) -> SequenceId {
        self.active = false;
        self.id
    }
}

impl Drop for SequenceLease {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.pool.release(self.id) {
                log::error!("Returning leased sequence id failed: {}", err);
            }
        }
    }
}
