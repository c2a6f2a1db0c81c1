//! A one-time-init wrapper for embedding a single [`HeapAllocator`] behind a `static`,
//! the way the page-frame allocator this crate's page arena pairs with sets up its own
//! global pool.
use conquer_once::spin::OnceCell;

use crate::kh::HeapAllocator;
use crate::platform::PageSource;
use crate::policy::Policy;

/// Holds at most one [`HeapAllocator<PS>`], set up exactly once.
///
/// Intended to back a `static GLOBAL_HEAP: GlobalHeap<MyPageSource> = GlobalHeap::new();`
/// in an embedding kernel.
pub struct GlobalHeap<PS: PageSource> {
    inner: OnceCell<HeapAllocator<PS>>,
}

impl<PS: PageSource> GlobalHeap<PS> {
    pub const fn new() -> Self {
        Self { inner: OnceCell::uninit() }
    }

    /// Build the heap and store it.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn init(&self, heap_base: usize, heap_len: u32, link_base: usize, policy: Policy, page_source: PS) {
        self.inner
            .try_init_once(|| HeapAllocator::new(heap_base, heap_len, link_base, policy, page_source))
            .expect("global heap already initialized");
    }

    /// Borrow the heap.
    ///
    /// # Panics
    ///
    /// Panics if [`GlobalHeap::init`] has not run yet.
    pub fn get(&self) -> &HeapAllocator<PS> {
        self.inner.get().expect("global heap not initialized")
    }
}

impl<PS: PageSource> Default for GlobalHeap<PS> {
    fn default() -> Self {
        Self::new()
    }
}
