// src/config.rs - Explicit configuration injected into sessions, pools and batches
use std::sync::{Arc, Mutex};

use crate::batch::{BatchBuilder, DEFAULT_ITEM_CAPACITY, DEFAULT_SEQUENCE_CAPACITY};
use crate::error::{NativeError, Result};
use crate::native::NativeEngine;
use crate::seq_ids::SequenceIdAllocator;

/// Largest number of tokens submitted in one chunk of a long prompt
pub const DEFAULT_MAX_BATCH_TOKENS: usize = 512;
pub const DEFAULT_MAX_SEQUENCES: usize = 8;

/// Everything the core needs to know about the engine and its limits.
///
/// Nothing here is process-global: two configs can drive two engines side by side. Clones
/// share the engine and, if enabled, the inference lock.
#[derive(Clone)]
pub struct NativeConfig {
    /// Parallel sequence slots the engine context was created with
    pub max_sequences: usize,
    /// Floats per item for embedding input, 0 for token input
    pub embedding_width: usize,
    /// Initial item capacity of batches built from this config
    pub batch_capacity: usize,
    /// Initial per-item sequence capacity of batches built from this config
    pub sequence_capacity: usize,
    /// Chunk size for prompt decoding
    pub max_batch_tokens: usize,
    /// Install the log bridge on the engine when a session starts
    pub forward_native_logs: bool,
    engine: Option<Arc<dyn NativeEngine>>,
    inference_lock: Option<Arc<Mutex<()>>>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            max_sequences: DEFAULT_MAX_SEQUENCES,
            embedding_width: 0,
            batch_capacity: DEFAULT_ITEM_CAPACITY,
            sequence_capacity: DEFAULT_SEQUENCE_CAPACITY,
            max_batch_tokens: DEFAULT_MAX_BATCH_TOKENS,
            forward_native_logs: true,
            engine: None,
            inference_lock: None,
        }
    }
}

impl std::fmt::Debug for NativeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeConfig")
            .field("max_sequences", &self.max_sequences)
            .field("embedding_width", &self.embedding_width)
            .field("batch_capacity", &self.batch_capacity)
            .field("sequence_capacity", &self.sequence_capacity)
            .field("max_batch_tokens", &self.max_batch_tokens)
            .field("forward_native_logs", &self.forward_native_logs)
            .field("engine", &self.engine.is_some())
            .field("serialized", &self.inference_lock.is_some())
            .finish()
    }
}

impl NativeConfig {
    pub fn new<E: NativeEngine + 'static>(engine: E) -> Self {
        Self::default().with_engine(Arc::new(engine))
    }

    pub fn with_engine(mut self, engine: Arc<dyn NativeEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_max_sequences(mut self, max_sequences: usize) -> Self {
        self.max_sequences = max_sequences;
        self
    }

    pub fn with_embedding_width(mut self, width: usize) -> Self {
        self.embedding_width = width;
        self
    }

    pub fn with_batch_capacity(mut self, items: usize, sequences: usize) -> Self {
        self.batch_capacity = items;
        self.sequence_capacity = sequences;
        self
    }

    pub fn with_max_batch_tokens(mut self, tokens: usize) -> Self {
        self.max_batch_tokens = tokens;
        self
    }

    pub fn with_native_logs(mut self, forward: bool) -> Self {
        self.forward_native_logs = forward;
        self
    }

    /// Serialize every native call made through sessions sharing this config.
    /// Some engine builds are not safe to call from several threads at once.
    pub fn with_serialized_inference(mut self) -> Self {
        self.inference_lock = Some(Arc::new(Mutex::new(())));
        self
    }

    pub fn engine(&self) -> Result<&Arc<dyn NativeEngine>> {
        self.engine
            .as_ref()
            .ok_or(NativeError::InvalidConfig("no native engine configured"))
    }

    pub(crate) fn inference_lock(&self) -> Option<&Arc<Mutex<()>>> {
        self.inference_lock.as_ref()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sequences == 0 {
            return Err(NativeError::InvalidConfig("max_sequences must be at least 1"));
        }
        if self.max_batch_tokens == 0 {
            return Err(NativeError::InvalidConfig("max_batch_tokens must be at least 1"));
        }
        if self.batch_capacity == 0 || self.sequence_capacity == 0 {
            return Err(NativeError::InvalidConfig("batch capacities must be at least 1"));
        }
        self.engine()?;
        Ok(())
    }

    /// Sequence id pool sized to the engine's parallel slots
    pub fn sequence_pool(&self) -> SequenceIdAllocator {
        SequenceIdAllocator::new(self.max_sequences)
    }

    /// Empty batch in this config's input mode
    pub fn batch_builder(&self) -> BatchBuilder {
        BatchBuilder::with_capacity(
            self.embedding_width,
            self.batch_capacity,
            self.sequence_capacity,
        )
    }
}
