//! Collaborators the allocator expects its embedder to supply: a source of fixed-size
//! physical pages, and the page size those pages come in.
use core::ptr::NonNull;

use crate::error::PageSourceError;

/// Size, in bytes, of a page handed out by a [`PageSource`].
///
/// The page arena ([`crate::blk`]) carves its metadata slots out of pages this size; it
/// never requests a different size.
pub const PAGE_SIZE: usize = 4096;

/// An external allocator of fixed-size pages, analogous to a kernel's physical page
/// allocator (`page_alloc`/`page_free`).
///
/// Implementors must hand out pages that are at least [`PAGE_SIZE`]-aligned and
/// [`PAGE_SIZE`] bytes long; the arena writes a header and a slot array into the page
/// without further bounds checking.
pub trait PageSource {
    /// Obtain one fresh page. Returns `Err` once the collaborator is exhausted; callers
    /// treat this as ordinary allocation failure, never a fatal condition.
    fn allocate(&self) -> Result<NonNull<u8>, PageSourceError>;

    /// Return a page previously handed out by [`PageSource::allocate`] on `self`.
    ///
    /// # Safety
    ///
    /// `page` must be a pointer returned by this same source's `allocate`, not
    /// currently in use by any live slot.
    unsafe fn deallocate(&self, page: NonNull<u8>);
}
