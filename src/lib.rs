#![no_std]
#![allow(clippy::missing_safety_doc)]

//! A kernel heap allocator, in two flavors sharing one embedder contract.
//!
//! [`kh`] is the primary design: a pair of red-black trees (one ordered by address, one
//! by size) whose own node metadata is carved out of pages pulled from a
//! [`platform::PageSource`], chosen via a [`policy::Policy`]. [`headerlist`] is a
//! simpler K&R-style circular free list for embedders that would rather not stand up a
//! page arena.
//!
//! Neither design allocates its own backing memory or locking primitive beyond
//! [`spin::Mutex`]; the embedder supplies the heap region and, for [`kh`], the page
//! source.

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod blk;
pub mod error;
pub mod global;
pub mod headerlist;
pub mod kh;
pub mod platform;
pub mod policy;
pub mod rb;

pub use error::{BaseError, CanFail};
pub use kh::HeapAllocator;
pub use platform::PageSource;
pub use policy::Policy;
