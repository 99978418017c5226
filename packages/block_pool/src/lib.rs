#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A slab allocator that hands out fixed-size memory blocks with stable addresses.
//!
//! This crate provides [`BlockPool`], an untyped allocator for many small allocations of the same
//! [`std::alloc::Layout`]. Memory is requested from the global allocator one chunk of blocks at a
//! time and every vacant block of every chunk is kept on an intrusive free list.
//!
//! # Key Features
//!
//! - **Stable addresses**: A block never moves while it is handed out
//! - **O(1) allocate and release**: Both are a single push or pop on the free list
//! - **Chunk-granular growth**: The pool grows by a configurable number of blocks at a time
//! - **No proactive shrinking**: Memory is only returned to the global allocator when the pool
//!   is dropped, all chunks at once
//! - **Configurable exhaustion policy**: Abort, fail silently or fail with a warning when the
//!   global allocator runs out of memory
//! - **Independent instances**: There is no global state; every pool owns its own chunks
//!
//! The pool never creates references to block contents and never drops anything stored in a
//! block. Typed containers build on top of it by writing values into blocks and dropping them
//! before releasing the block.
//!
//! # Example
//!
//! ```
//! use std::num::NonZero;
//!
//! use block_pool::BlockPool;
//!
//! let mut pool = BlockPool::builder()
//!     .block_layout_of::<[u64; 2]>()
//!     .growth(NonZero::new(4).unwrap())
//!     .build()
//!     .unwrap();
//!
//! let blocks = (0..5)
//!     .map(|_| pool.allocate().unwrap())
//!     .collect::<Vec<_>>();
//!
//! // Five blocks do not fit in one chunk of four, so the pool grew twice.
//! assert_eq!(pool.chunk_count(), 2);
//! assert_eq!(pool.len(), 5);
//!
//! for block in blocks {
//!     // SAFETY: Every block came from this pool and is released exactly once.
//!     unsafe { pool.release(block) };
//! }
//!
//! // Capacity is retained for reuse.
//! assert!(pool.is_empty());
//! assert_eq!(pool.capacity(), 8);
//! ```

mod allocation_policy;
mod builder;
mod chunk;
mod error;
mod pool;

pub use allocation_policy::*;
pub use builder::*;
pub(crate) use chunk::*;
pub use error::{AllocError, BuildError};
pub(crate) use error::Result;
pub use pool::BlockPool;
