// src/batch.rs - Columnar batch builder feeding one native decode/encode call
use crate::error::{NativeError, Result};
use crate::native::NativeBatch;
use crate::pin::PinnedRegion;
use crate::types::{Position, SequenceId, Token};

// Both capacities grow on demand, these are just starting points
pub const DEFAULT_ITEM_CAPACITY: usize = 128;
pub const DEFAULT_SEQUENCE_CAPACITY: usize = 1;

/// What kind of payload each item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    Tokens,
    Embeddings { width: usize },
}

/// Payload of a single item
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Token(Token),
    Embedding(&'a [f32]),
}

/// Struct-of-arrays batch.
///
/// Every column is sized to `item_capacity` (the sequence-id store to
/// `item_capacity * seq_capacity`) and only the first `len` rows are meaningful. Rows past
/// `len` keep whatever an earlier batch wrote there and are never exposed.
#[derive(Debug)]
pub struct BatchBuilder {
    mode: BatchMode,
    len: usize,
    item_capacity: usize,
    seq_capacity: usize,

    tokens: Vec<Token>,
    embeddings: Vec<f32>,
    positions: Vec<Position>,
    seq_counts: Vec<i32>,
    /// Row-major, stride `seq_capacity`
    seq_ids: Vec<SequenceId>,
    /// Per-row pointers into `seq_ids`, refreshed on every materialization
    seq_id_ptrs: Vec<*mut SequenceId>,
    output_flags: Vec<i8>,

    /// (sequence, item index) for every item that asked for output, in insertion order
    output_positions: Vec<(SequenceId, usize)>,
    growth_count: usize,
}

// The raw pointers in `seq_id_ptrs` only ever point into this builder's own `seq_ids`.
unsafe impl Send for BatchBuilder {}

impl BatchBuilder {
    /// Create a builder. `item_width == 0` selects token mode, anything else selects
    /// embedding mode with that many floats per item.
    pub fn new(item_width: usize) -> Self {
        Self::with_capacity(item_width, DEFAULT_ITEM_CAPACITY, DEFAULT_SEQUENCE_CAPACITY)
    }

    /// Create a builder with explicit starting capacities (each clamped to at least 1)
    pub fn with_capacity(item_width: usize, items: usize, sequences: usize) -> Self {
        let items = items.max(1);
        let sequences = sequences.max(1);
        let mode = if item_width == 0 {
            BatchMode::Tokens
        } else {
            BatchMode::Embeddings { width: item_width }
        };

        let (tokens, embeddings) = match mode {
            BatchMode::Tokens => (vec![Token::default(); items], Vec::new()),
            BatchMode::Embeddings { width } => (Vec::new(), vec![0.0; items * width]),
        };

        Self {
            mode,
            len: 0,
            item_capacity: items,
            seq_capacity: sequences,
            tokens,
            embeddings,
            positions: vec![Position::default(); items],
            seq_counts: vec![0; items],
            seq_ids: vec![SequenceId::default(); items * sequences],
            seq_id_ptrs: vec![std::ptr::null_mut(); items],
            output_flags: vec![0; items],
            output_positions: Vec::new(),
            growth_count: 0,
        }
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    /// Floats per item, 0 in token mode
    pub fn item_width(&self) -> usize {
        match self.mode {
            BatchMode::Tokens => 0,
            BatchMode::Embeddings { width } => width,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn item_capacity(&self) -> usize {
        self.item_capacity
    }

    /// Maximum number of sequences a single item can belong to before growing
    pub fn sequence_capacity(&self) -> usize {
        self.seq_capacity
    }

    /// Number of times any column had to be reallocated
    pub fn growth_count(&self) -> usize {
        self.growth_count
    }

    /// Append one item and return its index.
    ///
    /// The input is fully validated before anything is written, so a rejected item leaves
    /// the builder untouched.
    pub fn add(
        &mut self,
        payload: Payload<'_>,
        position: Position,
        sequences: &[SequenceId],
        want_output: bool,
    ) -> Result<usize> {
        match (self.mode, &payload) {
            (BatchMode::Tokens, Payload::Token(_)) => {}
            (BatchMode::Embeddings { width }, Payload::Embedding(values)) => {
                if values.len() != width {
                    return Err(NativeError::DimensionMismatch {
                        expected: width,
                        actual: values.len(),
                    });
                }
            }
            _ => return Err(NativeError::PayloadKindMismatch),
        }
        let index = self.reserve_row(sequences)?;

        match payload {
            Payload::Token(token) => self.tokens[index] = token,
            Payload::Embedding(values) => {
                let width = values.len();
                self.embeddings[index * width..(index + 1) * width].copy_from_slice(values);
            }
        }

        self.commit_row(index, position, sequences, want_output);
        Ok(index)
    }

    /// Add a token shared by several sequences at the same position
    pub fn add_token(
        &mut self,
        token: Token,
        position: Position,
        sequences: &[SequenceId],
        want_output: bool,
    ) -> Result<usize> {
        self.add(Payload::Token(token), position, sequences, want_output)
    }

    pub fn add_token_single(
        &mut self,
        token: Token,
        position: Position,
        sequence: SequenceId,
        want_output: bool,
    ) -> Result<usize> {
        self.add(Payload::Token(token), position, &[sequence], want_output)
    }

    pub fn add_embedding(
        &mut self,
        embedding: &[f32],
        position: Position,
        sequences: &[SequenceId],
        want_output: bool,
    ) -> Result<usize> {
        self.add(Payload::Embedding(embedding), position, sequences, want_output)
    }

    pub fn add_embedding_single(
        &mut self,
        embedding: &[f32],
        position: Position,
        sequence: SequenceId,
        want_output: bool,
    ) -> Result<usize> {
        self.add(Payload::Embedding(embedding), position, &[sequence], want_output)
    }

    /// Add an embedding by letting `write` fill the item's slot in place.
    ///
    /// The slot is zeroed before `write` runs, so a writer that skips entries leaves zeros
    /// rather than data from an earlier batch.
    pub fn add_embedding_with<F>(
        &mut self,
        write: F,
        position: Position,
        sequences: &[SequenceId],
        want_output: bool,
    ) -> Result<usize>
    where
        F: FnOnce(&mut [f32]),
    {
        let width = match self.mode {
            BatchMode::Embeddings { width } => width,
            BatchMode::Tokens => return Err(NativeError::PayloadKindMismatch),
        };
        let index = self.reserve_row(sequences)?;

        let slot = &mut self.embeddings[index * width..(index + 1) * width];
        slot.fill(0.0);
        write(slot);

        self.commit_row(index, position, sequences, want_output);
        Ok(index)
    }

    /// Reset the item count. Capacity is kept, so refilling up to the previous high-water
    /// mark does not allocate.
    pub fn clear(&mut self) {
        self.len = 0;
        self.output_positions.clear();
    }

    pub fn token(&self, index: usize) -> Option<Token> {
        match self.mode {
            BatchMode::Tokens if index < self.len => Some(self.tokens[index]),
            _ => None,
        }
    }

    pub fn embedding(&self, index: usize) -> Option<&[f32]> {
        match self.mode {
            BatchMode::Embeddings { width } if index < self.len => {
                Some(&self.embeddings[index * width..(index + 1) * width])
            }
            _ => None,
        }
    }

    pub fn position(&self, index: usize) -> Option<Position> {
        self.positions[..self.len].get(index).copied()
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions[..self.len]
    }

    /// Sequences the item at `index` belongs to
    pub fn sequences(&self, index: usize) -> Option<&[SequenceId]> {
        if index >= self.len {
            return None;
        }
        let start = index * self.seq_capacity;
        let count = self.seq_counts[index] as usize;
        Some(&self.seq_ids[start..start + count])
    }

    pub fn wants_output(&self, index: usize) -> Option<bool> {
        self.output_flags[..self.len].get(index).map(|flag| *flag != 0)
    }

    /// Retrievable outputs as (sequence, item index) pairs, in insertion order
    pub fn output_positions(&self) -> &[(SequenceId, usize)] {
        &self.output_positions
    }

    pub fn output_count(&self) -> usize {
        self.output_positions.len()
    }

    /// Item indices that produce output for `sequence`, oldest first
    pub fn outputs_for(&self, sequence: SequenceId) -> impl Iterator<Item = usize> + '_ {
        self.output_positions
            .iter()
            .filter(move |(seq, _)| *seq == sequence)
            .map(|(_, index)| *index)
    }

    /// Validate membership, grow as needed and return the index the next row will use
    fn reserve_row(&mut self, sequences: &[SequenceId]) -> Result<usize> {
        if sequences.is_empty() {
            return Err(NativeError::EmptySequenceSet);
        }
        if self.len >= i32::MAX as usize {
            return Err(NativeError::BatchFull);
        }

        if self.len == self.item_capacity {
            self.grow_items();
        }
        if sequences.len() > self.seq_capacity {
            self.grow_sequences(sequences.len());
        }
        Ok(self.len)
    }

    fn commit_row(
        &mut self,
        index: usize,
        position: Position,
        sequences: &[SequenceId],
        want_output: bool,
    ) {
        self.positions[index] = position;
        self.seq_counts[index] = sequences.len() as i32;
        let start = index * self.seq_capacity;
        self.seq_ids[start..start + sequences.len()].copy_from_slice(sequences);
        self.output_flags[index] = i8::from(want_output);

        if want_output {
            for &sequence in sequences {
                self.output_positions.push((sequence, index));
            }
        }

        self.len += 1;
    }

    fn grow_items(&mut self) {
        let new_capacity = self.item_capacity * 2;
        log::debug!(
            "Growing batch item capacity {} -> {}",
            self.item_capacity,
            new_capacity
        );

        match self.mode {
            BatchMode::Tokens => self.tokens.resize(new_capacity, Token::default()),
            BatchMode::Embeddings { width } => self.embeddings.resize(new_capacity * width, 0.0),
        }
        self.positions.resize(new_capacity, Position::default());
        self.seq_counts.resize(new_capacity, 0);
        self.seq_ids
            .resize(new_capacity * self.seq_capacity, SequenceId::default());
        self.seq_id_ptrs.resize(new_capacity, std::ptr::null_mut());
        self.output_flags.resize(new_capacity, 0);

        self.item_capacity = new_capacity;
        self.growth_count += 1;
    }

    fn grow_sequences(&mut self, at_least: usize) {
        let old_stride = self.seq_capacity;
        let new_stride = (old_stride * 2).max(at_least);
        log::debug!(
            "Growing per-item sequence capacity {} -> {}",
            old_stride,
            new_stride
        );

        // Re-stride every row; rows past `len` carry nothing worth keeping but copying them
        // keeps the loop branch-free.
        let mut restrided = vec![SequenceId::default(); self.item_capacity * new_stride];
        for (old_row, new_row) in self
            .seq_ids
            .chunks_exact(old_stride)
            .zip(restrided.chunks_exact_mut(new_stride))
        {
            new_row[..old_stride].copy_from_slice(old_row);
        }

        self.seq_ids = restrided;
        self.seq_capacity = new_stride;
        self.growth_count += 1;
    }

    /// Refresh the per-row pointer table and describe the columns as one native request.
    ///
    /// The returned addresses stay valid only while `self` is not mutated.
    pub(crate) fn native_view(&mut self) -> NativeBatch {
        let base = self.seq_ids.as_mut_ptr();
        for (row, slot) in self.seq_id_ptrs[..self.len].iter_mut().enumerate() {
            // Stays inside `seq_ids`: row < item_capacity and the store holds
            // item_capacity * seq_capacity entries.
            *slot = unsafe { base.add(row * self.seq_capacity) };
        }

        let (token, embd) = match self.mode {
            BatchMode::Tokens => (self.tokens.as_mut_ptr(), std::ptr::null_mut()),
            BatchMode::Embeddings { .. } => (std::ptr::null_mut(), self.embeddings.as_mut_ptr()),
        };

        NativeBatch {
            n_tokens: self.len as i32,
            token,
            embd,
            pos: self.positions.as_mut_ptr(),
            n_seq_id: self.seq_counts.as_mut_ptr(),
            seq_id: self.seq_id_ptrs.as_mut_ptr(),
            logits: self.output_flags.as_mut_ptr(),
        }
    }

    /// Memory regions the native call reads for the current item count
    pub(crate) fn pin_regions(&self) -> [PinnedRegion; 6] {
        let len = self.len;
        let payload = match self.mode {
            BatchMode::Tokens => PinnedRegion::of_slice("tokens", &self.tokens[..len]),
            BatchMode::Embeddings { width } => {
                PinnedRegion::of_slice("embeddings", &self.embeddings[..len * width])
            }
        };

        [
            payload,
            PinnedRegion::of_slice("positions", &self.positions[..len]),
            PinnedRegion::of_slice("seq_counts", &self.seq_counts[..len]),
            PinnedRegion::of_slice("seq_id_ptrs", &self.seq_id_ptrs[..len]),
            PinnedRegion::of_slice("seq_ids", &self.seq_ids[..len * self.seq_capacity]),
            PinnedRegion::of_slice("output_flags", &self.output_flags[..len]),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(id: i32) -> SequenceId {
        SequenceId(id)
    }

    #[test]
    fn test_token_mode_defaults() {
        let batch = BatchBuilder::new(0);
        assert_eq!(batch.mode(), BatchMode::Tokens);
        assert_eq!(batch.item_capacity(), DEFAULT_ITEM_CAPACITY);
        assert_eq!(batch.sequence_capacity(), DEFAULT_SEQUENCE_CAPACITY);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_add_returns_index_and_stores_row() {
        let mut batch = BatchBuilder::new(0);
        let first = batch.add_token_single(Token(11), Position(0), seq(3), false).unwrap();
        let second = batch.add_token(Token(12), Position(1), &[seq(3), seq(4)], true).unwrap();

        assert_eq!((first, second), (0, 1));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.token(1), Some(Token(12)));
        assert_eq!(batch.position(1), Some(Position(1)));
        assert_eq!(batch.sequences(1), Some(&[seq(3), seq(4)][..]));
        assert_eq!(batch.wants_output(0), Some(false));
        assert_eq!(batch.wants_output(1), Some(true));
        assert_eq!(batch.output_positions(), &[(seq(3), 1), (seq(4), 1)]);
        assert_eq!(batch.token(2), None);
    }

    #[test]
    fn test_item_growth_scenario() {
        let mut batch = BatchBuilder::new(0);
        for i in 0..129 {
            batch
                .add_token_single(Token(i), Position(i), seq(0), i == 128)
                .unwrap();
        }

        assert_eq!(batch.len(), 129);
        assert!(batch.item_capacity() >= 256);
        assert!(batch.growth_count() >= 1);
        assert_eq!(batch.output_positions(), &[(seq(0), 128)]);
        for i in 0..129 {
            let row = i as usize;
            assert_eq!(batch.token(row), Some(Token(i)));
            assert_eq!(batch.position(row), Some(Position(i)));
            assert_eq!(batch.sequences(row), Some(&[seq(0)][..]));
            assert_eq!(batch.wants_output(row), Some(i == 128));
        }
    }

    #[test]
    fn test_sequence_growth_preserves_rows() {
        let mut batch = BatchBuilder::with_capacity(0, 4, 1);
        batch.add_token_single(Token(1), Position(0), seq(0), false).unwrap();
        batch.add_token_single(Token(2), Position(1), seq(1), false).unwrap();
        let before: Vec<Vec<SequenceId>> =
            (0..2).map(|i| batch.sequences(i).unwrap().to_vec()).collect();

        batch
            .add_token(Token(3), Position(2), &[seq(0), seq(1), seq(2)], true)
            .unwrap();

        assert_eq!(batch.sequence_capacity(), 3);
        for (i, row) in before.iter().enumerate() {
            assert_eq!(batch.sequences(i).unwrap(), row.as_slice());
        }
        assert_eq!(batch.sequences(2), Some(&[seq(0), seq(1), seq(2)][..]));
    }

    #[test]
    fn test_sequence_growth_doubles_when_small_overflow() {
        let mut batch = BatchBuilder::with_capacity(0, 4, 2);
        batch
            .add_token(Token(1), Position(0), &[seq(0), seq(1), seq(2)], false)
            .unwrap();
        assert_eq!(batch.sequence_capacity(), 4);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut batch = BatchBuilder::new(0);
        for i in 0..200 {
            batch.add_token_single(Token(i), Position(i), seq(0), true).unwrap();
        }
        let capacity = batch.item_capacity();
        let growths = batch.growth_count();

        batch.clear();
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.output_count(), 0);
        assert_eq!(batch.position(0), None);

        for i in 0..200 {
            batch.add_token_single(Token(i), Position(i), seq(1), false).unwrap();
        }
        assert_eq!(batch.item_capacity(), capacity);
        assert_eq!(batch.growth_count(), growths);
    }

    #[test]
    fn test_embedding_dimension_mismatch_leaves_state() {
        let mut batch = BatchBuilder::new(4);
        let err = batch
            .add_embedding_single(&[1.0, 2.0, 3.0], Position(0), seq(0), true)
            .unwrap_err();

        assert_eq!(err, NativeError::DimensionMismatch { expected: 4, actual: 3 });
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.output_count(), 0);
    }

    #[test]
    fn test_embedding_rows() {
        let mut batch = BatchBuilder::with_capacity(2, 1, 1);
        batch.add_embedding_single(&[1.0, 2.0], Position(0), seq(0), false).unwrap();
        batch.add_embedding_single(&[3.0, 4.0], Position(1), seq(0), true).unwrap();
        let index = batch
            .add_embedding_with(|slot| slot[1] = 9.0, Position(2), &[seq(0)], false)
            .unwrap();

        assert_eq!(index, 2);
        assert_eq!(batch.embedding(0), Some(&[1.0, 2.0][..]));
        assert_eq!(batch.embedding(1), Some(&[3.0, 4.0][..]));
        assert_eq!(batch.embedding(2), Some(&[0.0, 9.0][..]));
        assert_eq!(batch.token(0), None);
    }

    #[test]
    fn test_rejects_empty_sequences_and_wrong_kind() {
        let mut tokens = BatchBuilder::new(0);
        assert_eq!(
            tokens.add_token(Token(1), Position(0), &[], true),
            Err(NativeError::EmptySequenceSet)
        );
        assert_eq!(
            tokens.add_embedding_single(&[1.0], Position(0), seq(0), false),
            Err(NativeError::PayloadKindMismatch)
        );

        let mut embeddings = BatchBuilder::new(1);
        assert_eq!(
            embeddings.add_token_single(Token(1), Position(0), seq(0), false),
            Err(NativeError::PayloadKindMismatch)
        );
        assert_eq!(tokens.len() + embeddings.len(), 0);
    }

    #[test]
    fn test_outputs_for_sequence() {
        let mut batch = BatchBuilder::new(0);
        batch.add_token_single(Token(1), Position(0), seq(0), true).unwrap();
        batch.add_token_single(Token(2), Position(0), seq(1), true).unwrap();
        batch.add_token_single(Token(3), Position(1), seq(0), true).unwrap();

        let zero: Vec<usize> = batch.outputs_for(seq(0)).collect();
        assert_eq!(zero, vec![0, 2]);
        assert_eq!(batch.outputs_for(seq(5)).count(), 0);
    }

    #[test]
    fn test_native_view_points_at_rows() {
        let mut batch = BatchBuilder::with_capacity(0, 2, 1);
        batch.add_token_single(Token(5), Position(7), seq(1), false).unwrap();
        batch.add_token(Token(6), Position(8), &[seq(2), seq(3)], true).unwrap();

        let native = batch.native_view();
        assert_eq!(native.n_tokens, 2);
        assert!(native.embd.is_null());
        unsafe {
            assert_eq!(*native.token.add(1), Token(6));
            assert_eq!(*native.pos, Position(7));
            assert_eq!(*native.n_seq_id.add(1), 2);
            let row = *native.seq_id.add(1);
            assert_eq!(*row, seq(2));
            assert_eq!(*row.add(1), seq(3));
            assert_eq!(*native.logits.add(1), 1);
        }
    }
}
