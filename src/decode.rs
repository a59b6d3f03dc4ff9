// src/decode.rs - Drive batches through the native engine for one context
use std::sync::{Arc, Mutex, MutexGuard};

use crate::batch::BatchBuilder;
use crate::config::NativeConfig;
use crate::error::{NativeError, Result};
use crate::handle::ContextHandle;
use crate::logging::native_log_callback;
use crate::native::{DecodeStatus, NativeEngine};
use crate::pin::{Materializer, PinBackend};
use crate::types::{Position, SequenceId, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Decode,
    Encode,
}

/// One engine context plus what is needed to submit batches to it
pub struct InferenceSession {
    context: ContextHandle,
    engine: Arc<dyn NativeEngine>,
    materializer: Materializer,
    inference_lock: Option<Arc<Mutex<()>>>,
    max_batch_tokens: usize,
}

impl InferenceSession {
    pub fn new(config: &NativeConfig, context: ContextHandle) -> Result<Self> {
        config.validate()?;
        let engine = Arc::clone(config.engine()?);
        if config.forward_native_logs {
            engine.set_log_callback(Some(native_log_callback));
        }

        log::info!(
            "Inference session ready: {} sequences, {} tokens per chunk",
            config.max_sequences,
            config.max_batch_tokens
        );

        Ok(Self {
            context,
            engine,
            materializer: Materializer::heap(),
            inference_lock: config.inference_lock().cloned(),
            max_batch_tokens: config.max_batch_tokens,
        })
    }

    /// Use a pinning backend other than plain heap memory
    pub fn with_pin_backend<B: PinBackend + 'static>(mut self, backend: B) -> Self {
        self.materializer = Materializer::new(backend);
        self
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// Submit `batch` to the engine's decoder.
    ///
    /// Empty batches return `Ok` without calling the engine. Pins are released before this
    /// returns, on every path. The status is passed through uninterpreted.
    pub fn decode(&self, batch: &mut BatchBuilder) -> Result<DecodeStatus> {
        self.submit(CallKind::Decode, batch)
    }

    /// Submit `batch` to the engine's encoder
    pub fn encode(&self, batch: &mut BatchBuilder) -> Result<DecodeStatus> {
        self.submit(CallKind::Encode, batch)
    }

    /// Decode a token run for one sequence in chunks of at most `max_batch_tokens`.
    ///
    /// `n_past` advances by one per submitted token. Only the final token requests output.
    /// Returns the status of the last call and how many tokens were *not* decoded.
    pub fn decode_tokens(
        &self,
        tokens: &[Token],
        sequence: SequenceId,
        batch: &mut BatchBuilder,
        n_past: &mut Position,
    ) -> Result<(DecodeStatus, usize)> {
        let mut remaining = tokens.len();
        let last = tokens.len().saturating_sub(1);

        for (chunk_index, chunk) in tokens.chunks(self.max_batch_tokens).enumerate() {
            batch.clear();
            let offset = chunk_index * self.max_batch_tokens;
            for (i, token) in chunk.iter().enumerate() {
                let next = n_past
                    .checked_offset(1)
                    .ok_or(NativeError::PositionOverflow(*n_past))?;
                batch.add_token_single(*token, *n_past, sequence, offset + i == last)?;
                *n_past = next;
            }

            let status = self.decode(batch)?;
            if !status.is_ok() {
                log::warn!(
                    "Chunked decode for {} stopped with {:?}, {} tokens left",
                    sequence,
                    status,
                    remaining
                );
                return Ok((status, remaining));
            }
            remaining -= chunk.len();
        }

        Ok((DecodeStatus::Ok, 0))
    }

    fn submit(&self, kind: CallKind, batch: &mut BatchBuilder) -> Result<DecodeStatus> {
        if batch.is_empty() {
            return Ok(DecodeStatus::Ok);
        }

        let items = batch.len();
        let context = self.context.enter()?;
        let _serial = self.serialize();
        let mut pinned = self.materializer.materialize(batch)?;

        let code = unsafe {
            match kind {
                CallKind::Decode => self.engine.decode(context.ptr(), pinned.native()),
                CallKind::Encode => self.engine.encode(context.ptr(), pinned.native()),
            }
        };

        // The engine already ran, so its status matters more than a pin bookkeeping error
        if let Err(err) = pinned.release() {
            log::error!("{:?} call completed but pin release failed: {}", kind, err);
        }

        let status = DecodeStatus::from_code(code);
        log::trace!("{:?} of {} items returned {:?}", kind, items, status);
        Ok(status)
    }

    fn serialize(&self) -> Option<MutexGuard<'_, ()>> {
        self.inference_lock
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}
