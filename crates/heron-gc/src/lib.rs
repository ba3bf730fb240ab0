//! # Heron heap
//!
//! Non-moving, generational, mark-sweep garbage collector managing every
//! user-visible value of the Heron runtime: list cells, environments,
//! promises, symbols, and typed vectors.
//!
//! ## Design
//!
//! - **Page-based slab allocation**: small fixed-size node slots live in
//!   uniform pages per size class; oversized vectors get individually
//!   allocated buffers
//! - **Three generations**: new space plus two tenured generations, with
//!   a write barrier tracking old-to-new references on intrusive
//!   old-to-new lists
//! - **Stop-the-world collection**: triggered at allocation entry points,
//!   never concurrent with the mutator; objects never move
//! - **Explicit roots**: a protect stack, a precious list, registered
//!   external anchors, and an optional host root enumerator
//! - **Finalizers**: at-most-once cleanup actions for environments and
//!   external pointers, run in fresh top-level contexts after reclamation
//! - **Adaptive sizing**: node and vector-cell budgets grow and shrink
//!   with post-collection occupancy

#![warn(clippy::all)]
#![warn(missing_docs)]

mod barrier;
mod collect;
pub mod error;
mod finalize;
pub mod heap;
mod list;
pub mod node;
mod page;
mod roots;

pub use error::{HeapError, HeapResult};
pub use heap::{EvalHook, GcConfig, GcStats, Heap, NativeFinalizer, RootHook};
pub use node::{NodeRef, NodeType};
pub use roots::TransientMark;
