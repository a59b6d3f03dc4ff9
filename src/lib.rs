//! Resource core between a managed host and a native inference engine.
//!
//! Batches are assembled in struct-of-arrays form ([`BatchBuilder`]), pinned for the length
//! of one native call ([`Materializer`]), and submitted through an [`InferenceSession`].
//! Sequence ids come from a bounded async pool ([`SequenceIdAllocator`]) and native
//! model/context pointers live in reference-counted handles ([`ModelHandle`],
//! [`ContextHandle`]) so a model is never freed under a live context.

pub mod batch;
pub mod config;
pub mod decode;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod logging;
pub mod native;
pub mod pin;
pub mod seq_ids;
pub mod types;

pub use batch::{BatchBuilder, BatchMode, Payload};
pub use config::NativeConfig;
pub use decode::InferenceSession;
pub use error::{NativeError, PinError, ReleaseError, Result};
pub use handle::{ContextHandle, HandleGuard, HandleState, ModelHandle, ResourceHandle};
pub use native::{DecodeStatus, ExternEngine, NativeBatch, NativeEngine};
pub use pin::{HeapPins, Materializer, PinBackend, PinnedBatch, PinnedRegion};
pub use seq_ids::{AllocatorStats, SequenceIdAllocator, SequenceLease};
pub use types::{Position, SequenceId, Token};
