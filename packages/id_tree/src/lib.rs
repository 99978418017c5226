#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A sparse map from small integer IDs to pinned elements, organized as a multi-level radix tree.
//!
//! [`IdTree<T>`] is meant for handle tables: callers pick IDs (or let the tree pick the next one
//! via [`IdTree::append()`]) and later look elements up by ID. IDs may be sparse, in which case
//! only the index pages on the paths to present IDs are allocated.
//!
//! Elements are stored in a [`block_pool::BlockPool`] owned by the tree and never move while
//! their ID is present. References to elements are returned as [`Pin`][std::pin::Pin] and raw
//! pointers obtained via [`IdTree::get_ptr()`] stay valid until the ID is removed.
//!
//! # Example
//!
//! ```
//! use id_tree::IdTree;
//!
//! let mut handles = IdTree::<String>::new();
//!
//! let (first, _) = handles.append("first".to_string()).unwrap();
//! let (second, _) = handles.append("second".to_string()).unwrap();
//! handles.set(1000, "far away".to_string()).unwrap();
//!
//! assert_eq!((first, second), (0, 1));
//! assert_eq!(handles.len(), 3);
//!
//! for (id, value) in &handles {
//!     println!("{id}: {value}");
//! }
//!
//! assert_eq!(handles.remove(second).as_deref(), Some("second"));
//! assert_eq!(handles.next_after(first), Some(1000));
//! ```
//!
//! # Configuration
//!
//! Use [`IdTree::builder()`] to configure the number of ID bits consumed per tree level, the
//! growth of element storage, what to do when memory runs out ([`AllocationPolicy`]), what to do
//! when a non-empty tree is dropped ([`DropPolicy`]) and from which ID on insertions are reported
//! as suspiciously large via a `tracing` warning.
//!
//! # Thread safety
//!
//! The tree is [`Send`] if `T` is, but not [`Sync`]. Wrap it in a lock to share it.

mod bits;
mod builder;
mod drop_policy;
mod error;
mod iter;
mod page;
mod tree;

pub(crate) use bits::*;
pub use block_pool::{AllocError, AllocationPolicy};
pub use builder::*;
pub use drop_policy::*;
pub use error::{BuildError, Error};
pub(crate) use error::Result;
pub use iter::*;
pub(crate) use page::*;
pub use tree::*;
