// src/ffi.rs - C ABI over batch building and sequence id pooling
use std::slice;

use crate::batch::BatchBuilder;
use crate::error::NativeError;
use crate::seq_ids::SequenceIdAllocator;
use crate::types::{Position, SequenceId, Token};

// Opaque pointers for C FFI
pub struct CBatchBuilder(BatchBuilder);
pub struct CSequencePool(SequenceIdAllocator);

// Error codes
pub const NATIVE_SUCCESS: i32 = 0;
pub const NATIVE_ERROR_INVALID_PARAM: i32 = -1;
pub const NATIVE_ERROR_DIMENSION: i32 = -2;
pub const NATIVE_ERROR_NO_SEQUENCE: i32 = -3;
pub const NATIVE_ERROR_BATCH_FULL: i32 = -4;
pub const NATIVE_ERROR_POOL_EXHAUSTED: i32 = -5;
pub const NATIVE_ERROR_NOT_HELD: i32 = -6;
pub const NATIVE_ERROR_RELEASED: i32 = -7;
pub const NATIVE_ERROR_PIN: i32 = -8;
pub const NATIVE_ERROR_NATIVE_CALL: i32 = -9;

fn error_code(err: &NativeError) -> i32 {
    match err {
        NativeError::DimensionMismatch { .. } | NativeError::PayloadKindMismatch => {
            NATIVE_ERROR_DIMENSION
        }
        NativeError::EmptySequenceSet => NATIVE_ERROR_NO_SEQUENCE,
        NativeError::BatchFull => NATIVE_ERROR_BATCH_FULL,
        NativeError::PositionOverflow(_) => NATIVE_ERROR_INVALID_PARAM,
        NativeError::PoolExhausted | NativeError::PoolExhaustedTimeout | NativeError::Cancelled => {
            NATIVE_ERROR_POOL_EXHAUSTED
        }
        NativeError::SequenceNotHeld(_) => NATIVE_ERROR_NOT_HELD,
        NativeError::InvalidHandleUse(_) => NATIVE_ERROR_RELEASED,
        NativeError::Pin(_) | NativeError::Release(_) => NATIVE_ERROR_PIN,
        NativeError::NativeCall(_) => NATIVE_ERROR_NATIVE_CALL,
        NativeError::InvalidConfig(_) => NATIVE_ERROR_INVALID_PARAM,
    }
}

/// Caller-owned id list; null is only accepted with a count of zero
unsafe fn sequences_from_raw<'a>(seq_ids: *const i32, n_seq: usize) -> Option<&'a [SequenceId]> {
    if n_seq == 0 {
        return Some(&[]);
    }
    if seq_ids.is_null() {
        return None;
    }
    // SequenceId is a transparent i32
    Some(slice::from_raw_parts(seq_ids as *const SequenceId, n_seq))
}

fn finish_add(result: crate::error::Result<usize>, index_out: *mut usize) -> i32 {
    match result {
        Ok(index) => {
            if !index_out.is_null() {
                unsafe { *index_out = index };
            }
            NATIVE_SUCCESS
        }
        Err(err) => {
            log::debug!("Batch add rejected: {}", err);
            error_code(&err)
        }
    }
}

/// Create a batch builder. `embedding_width` 0 selects token input.
#[no_mangle]
pub extern "C" fn native_batch_new(embedding_width: usize, capacity: usize) -> *mut CBatchBuilder {
    let builder = BatchBuilder::with_capacity(embedding_width, capacity.max(1), 1);
    Box::into_raw(Box::new(CBatchBuilder(builder)))
}

/// Destroy a batch builder
#[no_mangle]
pub extern "C" fn native_batch_free(batch: *mut CBatchBuilder) {
    if !batch.is_null() {
        unsafe {
            let _ = Box::from_raw(batch);
        }
    }
}

/// Append a token item
#[no_mangle]
pub extern "C" fn native_batch_add_token(
    batch: *mut CBatchBuilder,
    token: i32,
    position: i32,
    seq_ids: *const i32,
    n_seq: usize,
    want_output: bool,
    index_out: *mut usize,
) -> i32 {
    if batch.is_null() {
        return NATIVE_ERROR_INVALID_PARAM;
    }
    let Some(sequences) = (unsafe { sequences_from_raw(seq_ids, n_seq) }) else {
        return NATIVE_ERROR_INVALID_PARAM;
    };

    let batch = unsafe { &mut (*batch).0 };
    let result = batch.add_token(Token(token), Position(position), sequences, want_output);
    finish_add(result, index_out)
}

/// Append an embedding item of `n_values` floats
#[no_mangle]
pub extern "C" fn native_batch_add_embedding(
    batch: *mut CBatchBuilder,
    values: *const f32,
    n_values: usize,
    position: i32,
    seq_ids: *const i32,
    n_seq: usize,
    want_output: bool,
    index_out: *mut usize,
) -> i32 {
    if batch.is_null() || (values.is_null() && n_values != 0) {
        return NATIVE_ERROR_INVALID_PARAM;
    }
    let Some(sequences) = (unsafe { sequences_from_raw(seq_ids, n_seq) }) else {
        return NATIVE_ERROR_INVALID_PARAM;
    };

    let embedding: &[f32] = if n_values == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(values, n_values) }
    };
    let batch = unsafe { &mut (*batch).0 };
    let result = batch.add_embedding(embedding, Position(position), sequences, want_output);
    finish_add(result, index_out)
}

/// Remove all items, keeping capacity
#[no_mangle]
pub extern "C" fn native_batch_clear(batch: *mut CBatchBuilder) -> i32 {
    if batch.is_null() {
        return NATIVE_ERROR_INVALID_PARAM;
    }
    unsafe { (*batch).0.clear() };
    NATIVE_SUCCESS
}

#[no_mangle]
pub extern "C" fn native_batch_len(batch: *const CBatchBuilder) -> usize {
    if batch.is_null() {
        return 0;
    }
    unsafe { (*batch).0.len() }
}

#[no_mangle]
pub extern "C" fn native_batch_output_count(batch: *const CBatchBuilder) -> usize {
    if batch.is_null() {
        return 0;
    }
    unsafe { (*batch).0.output_count() }
}

/// Read the `nth` requested output as (sequence id, item index)
#[no_mangle]
pub extern "C" fn native_batch_get_output(
    batch: *const CBatchBuilder,
    nth: usize,
    seq_out: *mut i32,
    index_out: *mut usize,
) -> i32 {
    if batch.is_null() || seq_out.is_null() || index_out.is_null() {
        return NATIVE_ERROR_INVALID_PARAM;
    }

    let batch = unsafe { &(*batch).0 };
    match batch.output_positions().get(nth) {
        Some((sequence, index)) => {
            unsafe {
                *seq_out = sequence.value();
                *index_out = *index;
            }
            NATIVE_SUCCESS
        }
        None => NATIVE_ERROR_INVALID_PARAM,
    }
}

/// Create a pool lending ids `0..max_count`
#[no_mangle]
pub extern "C" fn native_seq_pool_new(max_count: usize) -> *mut CSequencePool {
    Box::into_raw(Box::new(CSequencePool(SequenceIdAllocator::new(max_count))))
}

/// Destroy a sequence pool
#[no_mangle]
pub extern "C" fn native_seq_pool_free(pool: *mut CSequencePool) {
    if !pool.is_null() {
        unsafe {
            let _ = Box::from_raw(pool);
        }
    }
}

/// Take a free id without waiting
#[no_mangle]
pub extern "C" fn native_seq_pool_try_acquire(pool: *const CSequencePool, id_out: *mut i32) -> i32 {
    if pool.is_null() || id_out.is_null() {
        return NATIVE_ERROR_INVALID_PARAM;
    }

    let pool = unsafe { &(*pool).0 };
    match pool.try_acquire() {
        Ok(id) => {
            unsafe { *id_out = id.value() };
            NATIVE_SUCCESS
        }
        Err(err) => error_code(&err),
    }
}

#[no_mangle]
pub extern "C" fn native_seq_pool_release(pool: *const CSequencePool, id: i32) -> i32 {
    if pool.is_null() {
        return NATIVE_ERROR_INVALID_PARAM;
    }

    let pool = unsafe { &(*pool).0 };
    match pool.release(SequenceId(id)) {
        Ok(()) => NATIVE_SUCCESS,
        Err(err) => error_code(&err),
    }
}

/// Get pool statistics
#[no_mangle]
pub extern "C" fn native_seq_pool_stats(
    pool: *const CSequencePool,
    capacity_out: *mut usize,
    available_out: *mut usize,
) -> i32 {
    if pool.is_null() || capacity_out.is_null() || available_out.is_null() {
        return NATIVE_ERROR_INVALID_PARAM;
    }

    let stats = unsafe { (*pool).0.stats() };
    unsafe {
        *capacity_out = stats.capacity;
        *available_out = stats.available;
    }
    NATIVE_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_batch_round_trip_through_c_api() {
        let batch = native_batch_new(0, 2);
        let seqs = [0i32, 3];
        let mut index = usize::MAX;

        for i in 0..3 {
            let rc = native_batch_add_token(batch, 10 + i, i, seqs.as_ptr(), 2, i == 2, &mut index);
            assert_eq!(rc, NATIVE_SUCCESS);
        }
        assert_eq!(index, 2);
        assert_eq!(native_batch_len(batch), 3);
        assert_eq!(native_batch_output_count(batch), 2);

        let mut seq = -1;
        assert_eq!(native_batch_get_output(batch, 1, &mut seq, &mut index), NATIVE_SUCCESS);
        assert_eq!((seq, index), (3, 2));
        assert_eq!(
            native_batch_get_output(batch, 2, &mut seq, &mut index),
            NATIVE_ERROR_INVALID_PARAM
        );

        assert_eq!(native_batch_clear(batch), NATIVE_SUCCESS);
        assert_eq!(native_batch_len(batch), 0);
        native_batch_free(batch);
    }

    #[test]
    fn test_batch_rejects_bad_input() {
        let batch = native_batch_new(4, 1);
        let short = [1.0f32, 2.0, 3.0];
        let full = [1.0f32; 4];
        let seq = 0i32;
        let no_index: *mut usize = ptr::null_mut();

        let rc = native_batch_add_embedding(batch, short.as_ptr(), 3, 0, &seq, 1, true, no_index);
        assert_eq!(rc, NATIVE_ERROR_DIMENSION);
        let rc = native_batch_add_token(batch, 1, 0, &seq, 1, true, no_index);
        assert_eq!(rc, NATIVE_ERROR_DIMENSION);

        let full = full.as_ptr();
        let rc = native_batch_add_embedding(batch, full, 4, 0, ptr::null(), 0, true, no_index);
        assert_eq!(rc, NATIVE_ERROR_NO_SEQUENCE);
        let rc = native_batch_add_embedding(batch, full, 4, 0, ptr::null(), 2, true, no_index);
        assert_eq!(rc, NATIVE_ERROR_INVALID_PARAM);
        assert_eq!(native_batch_len(batch), 0);

        native_batch_free(batch);
        assert_eq!(native_batch_len(ptr::null()), 0);
        assert_eq!(native_batch_clear(ptr::null_mut()), NATIVE_ERROR_INVALID_PARAM);
    }

    #[test]
    fn test_seq_pool_through_c_api() {
        let pool = native_seq_pool_new(2);
        let (mut a, mut b, mut c) = (-1, -1, -1);

        assert_eq!(native_seq_pool_try_acquire(pool, &mut a), NATIVE_SUCCESS);
        assert_eq!(native_seq_pool_try_acquire(pool, &mut b), NATIVE_SUCCESS);
        assert_ne!(a, b);
        assert_eq!(native_seq_pool_try_acquire(pool, &mut c), NATIVE_ERROR_POOL_EXHAUSTED);

        assert_eq!(native_seq_pool_release(pool, a), NATIVE_SUCCESS);
        assert_eq!(native_seq_pool_release(pool, a), NATIVE_ERROR_NOT_HELD);
        assert_eq!(native_seq_pool_release(pool, 99), NATIVE_ERROR_NOT_HELD);

        let (mut capacity, mut available) = (0, 0);
        assert_eq!(native_seq_pool_stats(pool, &mut capacity, &mut available), NATIVE_SUCCESS);
        assert_eq!((capacity, available), (2, 1));

        native_seq_pool_free(pool);
    }
}
