// src/pin.rs - Pin a batch's columns for one native call and release them as a group
use std::marker::PhantomData;

use crate::batch::BatchBuilder;
use crate::error::{NativeError, PinError, ReleaseError, Result};
use crate::native::NativeBatch;

/// Upper bound on regions per batch: payload, positions, counts, pointer table, ids, flags
const MAX_PINS: usize = 6;

/// A contiguous region whose address is handed to the native engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedRegion {
    label: &'static str,
    addr: *const u8,
    len: usize,
}

impl PinnedRegion {
    pub fn new(label: &'static str, addr: *const u8, len: usize) -> Self {
        Self { label, addr, len }
    }

    pub fn of_slice<T>(label: &'static str, slice: &[T]) -> Self {
        Self::new(label, slice.as_ptr() as *const u8, std::mem::size_of_val(slice))
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn addr(&self) -> *const u8 {
        self.addr
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Makes memory regions safe for the engine to dereference during a call.
///
/// Implementations backed by page-locking (host memory registration for device copies,
/// for example) do real work here. Each successful `pin` is matched by exactly one `unpin`.
pub trait PinBackend: Send + Sync {
    fn pin(&self, region: &PinnedRegion) -> std::result::Result<(), PinError>;
    fn unpin(&self, region: &PinnedRegion) -> std::result::Result<(), PinError>;
}

/// Plain heap memory: the builder is mutably borrowed for the whole call so its buffers
/// cannot move, and nothing else needs doing.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPins;

impl PinBackend for HeapPins {
    fn pin(&self, _region: &PinnedRegion) -> std::result::Result<(), PinError> {
        Ok(())
    }

    fn unpin(&self, _region: &PinnedRegion) -> std::result::Result<(), PinError> {
        Ok(())
    }
}

/// Turns a [`BatchBuilder`] into a [`NativeBatch`] backed by pinned memory
pub struct Materializer {
    backend: Box<dyn PinBackend>,
}

impl Materializer {
    pub fn new<B: PinBackend + 'static>(backend: B) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    pub fn heap() -> Self {
        Self::new(HeapPins)
    }

    /// Pin every column the native call reads and assemble the request.
    ///
    /// If a pin fails partway, the regions already pinned are released before the error is
    /// returned. The builder stays borrowed until the returned guard is dropped.
    pub fn materialize<'a>(&'a self, builder: &'a mut BatchBuilder) -> Result<PinnedBatch<'a>> {
        let regions = builder.pin_regions();
        let mut pins: [Option<PinnedRegion>; MAX_PINS] = [None; MAX_PINS];
        let mut pinned = 0;

        for region in regions.iter().filter(|region| !region.is_empty()) {
            if let Err(err) = self.backend.pin(region) {
                log::error!(
                    "Pinning {} ({} bytes) failed: {}, releasing {} earlier pins",
                    region.label(),
                    region.len(),
                    err,
                    pinned
                );
                if let Err(release_err) = release_all(self.backend.as_ref(), &pins[..pinned]) {
                    log::warn!("Cleanup after failed pin was incomplete: {}", release_err);
                }
                return Err(NativeError::Pin(err));
            }
            pins[pinned] = Some(*region);
            pinned += 1;
        }

        let native = builder.native_view();
        log::trace!("Materialized batch of {} items with {} pins", native.n_tokens, pinned);

        Ok(PinnedBatch {
            native,
            pins,
            pinned,
            released: false,
            backend: self.backend.as_ref(),
            _builder: PhantomData,
        })
    }
}

impl Default for Materializer {
    fn default() -> Self {
        Self::heap()
    }
}

/// Scope guard over the pins of one materialization.
///
/// Released on drop if [`PinnedBatch::release`] was not called. Addresses read from
/// [`PinnedBatch::native`] must not be used after release.
pub struct PinnedBatch<'a> {
    native: NativeBatch,
    pins: [Option<PinnedRegion>; MAX_PINS],
    pinned: usize,
    released: bool,
    backend: &'a dyn PinBackend,
    _builder: PhantomData<&'a mut BatchBuilder>,
}

impl<'a> PinnedBatch<'a> {
    pub fn native(&self) -> &NativeBatch {
        &self.native
    }

    pub fn pin_count(&self) -> usize {
        self.pinned
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Unpin everything. Returns how many regions were released by this call; a second call
    /// is a no-op returning 0. Every region is attempted even if some fail.
    pub fn release(&mut self) -> std::result::Result<usize, ReleaseError> {
        if self.released {
            return Ok(0);
        }
        self.released = true;
        release_all(self.backend, &self.pins[..self.pinned])
    }
}

impl Drop for PinnedBatch<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("Releasing pinned batch on drop: {}", err);
        }
    }
}

fn release_all(
    backend: &dyn PinBackend,
    pins: &[Option<PinnedRegion>],
) -> std::result::Result<usize, ReleaseError> {
    let mut attempted = 0;
    let mut failures = 0;
    let mut first = None;

    for region in pins.iter().flatten() {
        attempted += 1;
        if let Err(err) = backend.unpin(region) {
            log::warn!("Unpinning {} failed: {}", region.label(), err);
            failures += 1;
            first.get_or_insert(err);
        }
    }

    match first {
        None => Ok(attempted),
        Some(first) => Err(ReleaseError {
            failures,
            attempted,
            first,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, SequenceId, Token};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counts {
        pinned: AtomicUsize,
        unpinned: AtomicUsize,
    }

    struct CountingPins {
        counts: Arc<Counts>,
        fail_pin_at: Option<usize>,
        fail_unpin: Option<&'static str>,
    }

    impl CountingPins {
        fn new(counts: &Arc<Counts>) -> Self {
            Self {
                counts: Arc::clone(counts),
                fail_pin_at: None,
                fail_unpin: None,
            }
        }
    }

    impl PinBackend for CountingPins {
        fn pin(&self, _region: &PinnedRegion) -> std::result::Result<(), PinError> {
            let taken = self.counts.pinned.load(Ordering::SeqCst);
            if Some(taken) == self.fail_pin_at {
                return Err(PinError::OutOfMemory);
            }
            self.counts.pinned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unpin(&self, region: &PinnedRegion) -> std::result::Result<(), PinError> {
            self.counts.unpinned.fetch_add(1, Ordering::SeqCst);
            if Some(region.label()) == self.fail_unpin {
                return Err(PinError::Backend(-7));
            }
            Ok(())
        }
    }

    fn filled_batch() -> BatchBuilder {
        let mut batch = BatchBuilder::new(0);
        for i in 0..4 {
            batch
                .add_token_single(Token(i), Position(i), SequenceId(0), i == 3)
                .unwrap();
        }
        batch
    }

    #[test]
    fn test_release_is_exactly_once() {
        let counts = Arc::new(Counts::default());
        let materializer = Materializer::new(CountingPins::new(&counts));
        let mut batch = filled_batch();

        let mut pinned = materializer.materialize(&mut batch).unwrap();
        assert_eq!(pinned.pin_count(), MAX_PINS);
        assert_eq!(pinned.native().n_tokens, 4);

        assert_eq!(pinned.release(), Ok(MAX_PINS));
        assert_eq!(pinned.release(), Ok(0));
        drop(pinned);

        assert_eq!(counts.pinned.load(Ordering::SeqCst), MAX_PINS);
        assert_eq!(counts.unpinned.load(Ordering::SeqCst), MAX_PINS);
    }

    #[test]
    fn test_drop_releases() {
        let counts = Arc::new(Counts::default());
        let materializer = Materializer::new(CountingPins::new(&counts));
        let mut batch = filled_batch();

        {
            let _pinned = materializer.materialize(&mut batch).unwrap();
        }
        assert_eq!(counts.unpinned.load(Ordering::SeqCst), MAX_PINS);

        // builder is usable again once the guard is gone
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_partial_pin_failure_releases_taken_pins() {
        let counts = Arc::new(Counts::default());
        let mut backend = CountingPins::new(&counts);
        backend.fail_pin_at = Some(3);
        let materializer = Materializer::new(backend);
        let mut batch = filled_batch();

        let err = materializer.materialize(&mut batch).err().unwrap();
        assert_eq!(err, NativeError::Pin(PinError::OutOfMemory));
        assert_eq!(counts.pinned.load(Ordering::SeqCst), 3);
        assert_eq!(counts.unpinned.load(Ordering::SeqCst), 3);
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_unpin_failure_does_not_stop_release() {
        let counts = Arc::new(Counts::default());
        let mut backend = CountingPins::new(&counts);
        backend.fail_unpin = Some("positions");
        let materializer = Materializer::new(backend);
        let mut batch = filled_batch();

        let mut pinned = materializer.materialize(&mut batch).unwrap();
        let err = pinned.release().unwrap_err();
        assert_eq!(err.failures, 1);
        assert_eq!(err.attempted, MAX_PINS);
        assert_eq!(err.first, PinError::Backend(-7));
        assert_eq!(counts.unpinned.load(Ordering::SeqCst), MAX_PINS);

        assert_eq!(pinned.release(), Ok(0));
        assert!(pinned.is_released());
    }

    #[test]
    fn test_empty_batch_takes_no_pins() {
        let materializer = Materializer::heap();
        let mut batch = BatchBuilder::new(0);
        let mut pinned = materializer.materialize(&mut batch).unwrap();
        assert_eq!(pinned.pin_count(), 0);
        assert_eq!(pinned.native().n_tokens, 0);
        assert_eq!(pinned.release(), Ok(0));
    }

    #[test]
    fn test_embedding_batch_exposes_embd() {
        let materializer = Materializer::heap();
        let mut batch = BatchBuilder::new(3);
        batch
            .add_embedding_single(&[0.5, 1.5, 2.5], Position(0), SequenceId(2), true)
            .unwrap();

        let pinned = materializer.materialize(&mut batch).unwrap();
        let native = pinned.native();
        assert!(native.is_embedding());
        assert!(native.token.is_null());
        unsafe {
            assert_eq!(*native.embd.add(2), 2.5);
        }
    }
}
