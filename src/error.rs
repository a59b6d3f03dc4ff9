// src/error.rs - Error taxonomy for the native boundary
use crate::native::DecodeStatus;
use crate::types::{Position, SequenceId};

/// Failure while pinning or unpinning a buffer region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// Backend could not lock more memory
    OutOfMemory,
    /// Backend rejected the region (raw backend code)
    Backend(i32),
}

impl std::fmt::Display for PinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinError::OutOfMemory => write!(f, "out of memory while pinning"),
            PinError::Backend(code) => write!(f, "pin backend error {}", code),
        }
    }
}

impl std::error::Error for PinError {}

/// Aggregate of every unpin failure seen during one release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseError {
    /// Number of regions that failed to unpin
    pub failures: usize,
    /// Number of regions that were attempted
    pub attempted: usize,
    /// First failure observed
    pub first: PinError,
}

impl std::fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} pinned regions failed to release (first: {})",
            self.failures, self.attempted, self.first
        )
    }
}

impl std::error::Error for ReleaseError {}

/// Errors raised by the batch core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    /// Embedding payload width differs from the builder's item width
    DimensionMismatch { expected: usize, actual: usize },
    /// Item added without any sequence membership
    EmptySequenceSet,
    /// Token payload given to an embedding builder, or the reverse
    PayloadKindMismatch,
    /// Item count would overflow the native `n_tokens` field
    BatchFull,
    /// Advancing a sequence position would overflow `i32`
    PositionOverflow(Position),
    /// No sequence id became free within the timeout
    PoolExhaustedTimeout,
    /// No sequence id free right now (non-waiting acquire)
    PoolExhausted,
    /// Acquire was cancelled by the caller
    Cancelled,
    /// Released id is out of range or not currently lent out
    SequenceNotHeld(SequenceId),
    /// Operation on a handle that has been released
    InvalidHandleUse(&'static str),
    Pin(PinError),
    Release(ReleaseError),
    /// Non-Ok status returned by the native engine
    NativeCall(DecodeStatus),
    InvalidConfig(&'static str),
}

impl From<PinError> for NativeError {
    fn from(err: PinError) -> Self {
        NativeError::Pin(err)
    }
}

impl From<ReleaseError> for NativeError {
    fn from(err: ReleaseError) -> Self {
        NativeError::Release(err)
    }
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeError::DimensionMismatch { expected, actual } => write!(
                f,
                "embedding must have {} dimensions, got {}",
                expected, actual
            ),
            NativeError::EmptySequenceSet => write!(f, "item must belong to at least one sequence"),
            NativeError::PayloadKindMismatch => write!(f, "payload kind does not match batch mode"),
            NativeError::BatchFull => write!(f, "batch item count limit reached"),
            NativeError::PositionOverflow(pos) => {
                write!(f, "position {} cannot advance further", pos.value())
            }
            NativeError::PoolExhaustedTimeout => write!(f, "timed out waiting for a sequence id"),
            NativeError::PoolExhausted => write!(f, "no sequence id available"),
            NativeError::Cancelled => write!(f, "sequence id acquire cancelled"),
            NativeError::SequenceNotHeld(id) => write!(f, "{} is not currently held", id),
            NativeError::InvalidHandleUse(kind) => write!(f, "{} handle already released", kind),
            NativeError::Pin(e) => write!(f, "pin failed: {}", e),
            NativeError::Release(e) => write!(f, "release failed: {}", e),
            NativeError::NativeCall(status) => write!(f, "native call returned {:?}", status),
            NativeError::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for NativeError {}

pub type Result<T> = std::result::Result<T, NativeError>;
