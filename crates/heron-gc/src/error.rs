//! Error types for heap operations

use thiserror::Error;

/// Heap error type
#[derive(Debug, Error)]
pub enum HeapError {
    /// No free nodes remain after a collection
    #[error("cons memory exhausted (limit reached {limit} nodes)")]
    ConsExhausted {
        /// Node limit in effect when the allocation failed
        limit: usize,
    },

    /// Not enough vector cells remain after a collection
    #[error("vector memory exhausted (needed {needed} cells, {free} free)")]
    VectorExhausted {
        /// Vector cells the allocation required
        needed: usize,
        /// Vector cells still available
        free: usize,
    },

    /// Requested vector length overflows the cell-size computation
    #[error("cannot allocate vector of length {length}")]
    VectorTooLong {
        /// Requested element count
        length: usize,
    },

    /// Finalizer target is not an environment or external pointer
    #[error("finalizer target must be an environment or external pointer")]
    InvalidFinalizerTarget,

    /// Finalizer function is not callable
    #[error("finalizer function must be a closure, builtin, or special")]
    InvalidFinalizerFunction,
}

/// Result type using HeapError
pub type HeapResult<T> = Result<T, HeapError>;
