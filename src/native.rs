// src/native.rs - Fixed-layout request and status codes of the native engine
use std::ffi::{c_char, c_void};
use std::ptr::{self, NonNull};

use crate::error::{NativeError, Result};
use crate::types::{Position, SequenceId, Token};

/// Input for one native decode/encode call.
///
/// Every array holds `n_tokens` entries. Exactly one of `token` / `embd` is non-null;
/// `embd` holds `n_tokens * item_width` floats.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeBatch {
    pub n_tokens: i32,
    pub token: *mut Token,
    pub embd: *mut f32,
    pub pos: *mut Position,
    pub n_seq_id: *mut i32,
    pub seq_id: *mut *mut SequenceId,
    pub logits: *mut i8,
}

impl NativeBatch {
    /// A request with no items and no addresses
    pub fn empty() -> Self {
        Self {
            n_tokens: 0,
            token: ptr::null_mut(),
            embd: ptr::null_mut(),
            pos: ptr::null_mut(),
            n_seq_id: ptr::null_mut(),
            seq_id: ptr::null_mut(),
            logits: ptr::null_mut(),
        }
    }

    pub fn is_embedding(&self) -> bool {
        !self.embd.is_null()
    }
}

/// Result of a native decode/encode call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStatus {
    Ok,
    /// No KV cache slot for the batch; free some sequences or shrink the batch
    NoKvSlot,
    /// Aborted by the engine's abort callback
    ComputeAborted,
    InvalidInputBatch,
    AllocationFailed,
    DecodeFailed,
}

impl DecodeStatus {
    /// Map a raw engine return code. Unknown codes are treated as `DecodeFailed`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DecodeStatus::Ok,
            1 => DecodeStatus::NoKvSlot,
            2 => DecodeStatus::ComputeAborted,
            -1 => DecodeStatus::InvalidInputBatch,
            -2 => DecodeStatus::AllocationFailed,
            -3 => DecodeStatus::DecodeFailed,
            other => {
                log::warn!("Unknown native decode status {}, treating as DecodeFailed", other);
                DecodeStatus::DecodeFailed
            }
        }
    }

    pub fn code(self) -> i32 {
        match self {
            DecodeStatus::Ok => 0,
            DecodeStatus::NoKvSlot => 1,
            DecodeStatus::ComputeAborted => 2,
            DecodeStatus::InvalidInputBatch => -1,
            DecodeStatus::AllocationFailed => -2,
            DecodeStatus::DecodeFailed => -3,
        }
    }

    pub fn is_ok(self) -> bool {
        self == DecodeStatus::Ok
    }

    /// Positive codes are warnings the caller can recover from (e.g. by freeing KV space)
    pub fn is_recoverable(self) -> bool {
        matches!(self, DecodeStatus::NoKvSlot | DecodeStatus::ComputeAborted)
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(NativeError::NativeCall(self))
        }
    }
}

/// Raw decode/encode entry point exported by the engine library
pub type RawBatchFn = unsafe extern "C" fn(context: *mut c_void, batch: NativeBatch) -> i32;

/// Raw destructor for an engine-owned object (model, context, ...)
pub type RawFreeFn = unsafe extern "C" fn(ptr: *mut c_void);

/// Log callback the engine invokes with (level, NUL-terminated text, user data)
pub type RawLogCallback =
    unsafe extern "C" fn(level: i32, text: *const c_char, user_data: *mut c_void);

/// Engine entry point that installs (or clears, with `None`) its log callback
pub type RawLogSetFn =
    unsafe extern "C" fn(callback: Option<RawLogCallback>, user_data: *mut c_void);

/// The foreign engine as seen by this crate
pub trait NativeEngine: Send + Sync {
    /// Run a decode call.
    ///
    /// # Safety
    /// `context` must be a live engine context and every address in `batch` must stay valid
    /// for the duration of the call.
    unsafe fn decode(&self, context: NonNull<c_void>, batch: &NativeBatch) -> i32;

    /// Run an encode call (encoder models). Same contract as [`NativeEngine::decode`].
    unsafe fn encode(&self, context: NonNull<c_void>, batch: &NativeBatch) -> i32;

    /// Route the engine's own log output. Engines without a log hook ignore this.
    fn set_log_callback(&self, _callback: Option<RawLogCallback>) {}
}

/// Engine reached through plain C function pointers
#[derive(Debug, Clone, Copy)]
pub struct ExternEngine {
    decode: RawBatchFn,
    encode: Option<RawBatchFn>,
    log_set: Option<RawLogSetFn>,
}

impl ExternEngine {
    pub fn new(decode: RawBatchFn) -> Self {
        Self {
            decode,
            encode: None,
            log_set: None,
        }
    }

    pub fn with_encode(mut self, encode: RawBatchFn) -> Self {
        self.encode = Some(encode);
        self
    }

    pub fn with_log_set(mut self, log_set: RawLogSetFn) -> Self {
        self.log_set = Some(log_set);
        self
    }
}

impl NativeEngine for ExternEngine {
    unsafe fn decode(&self, context: NonNull<c_void>, batch: &NativeBatch) -> i32 {
        (self.decode)(context.as_ptr(), *batch)
    }

    unsafe fn encode(&self, context: NonNull<c_void>, batch: &NativeBatch) -> i32 {
        match self.encode {
            Some(encode) => encode(context.as_ptr(), *batch),
            None => {
                log::error!("Engine library does not export an encode entry point");
                DecodeStatus::DecodeFailed.code()
            }
        }
    }

    fn set_log_callback(&self, callback: Option<RawLogCallback>) {
        if let Some(log_set) = self.log_set {
            unsafe { log_set(callback, std::ptr::null_mut()) };
        }
    }
}
