//! The dual red-black-tree heap allocator: one tree orders free and allocated blocks by
//! address (for coalescing and iteration), a second orders the free ones by size (for
//! best/worst fit), and the two are kept in lockstep on every allocation and free.
use spin::Mutex;

#[cfg(test)]
extern crate std;

use crate::blk::PageArena;
use crate::platform::PageSource;
use crate::policy::Policy;
use crate::rb::{ByAddr, BySize, Node, RbTree};

/// A handle to an allocated block, opaque to everything but its own address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPtr(usize);

impl HeapPtr {
    pub fn addr(&self) -> usize {
        self.0
    }

    /// # Safety
    ///
    /// The caller must not read or write past the number of bytes requested from
    /// [`HeapAllocator::alloc`] when this pointer was returned.
    pub unsafe fn as_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

struct TreeState {
    addr_tree: RbTree<ByAddr>,
    size_tree: RbTree<BySize>,
    /// Next-fit cursor: the address-tree offset to resume scanning from.
    last: i32,
}

/// A heap over `[heap_base, heap_base + heap_len)`, indexed by a pair of red-black
/// trees whose own metadata nodes live in a [`PageArena`] fed by `PS`.
pub struct HeapAllocator<PS: PageSource> {
    heap_base: usize,
    heap_len: u32,
    policy: Policy,
    trees: Mutex<TreeState>,
    arena: Mutex<PageArena<Node, PS>>,
}

impl<PS: PageSource> HeapAllocator<PS> {
    /// Build an allocator over `heap_len` bytes starting at `heap_base`, with tree node
    /// offsets relative to `link_base`.
    ///
    /// `link_base` is ordinarily `heap_base` itself, but a caller embedding several
    /// heaps that share one arena can choose any common origin the offsets will fit
    /// around.
    ///
    /// # Panics
    ///
    /// Panics if `page_source` cannot supply the four pages of tree-node metadata this
    /// needs just to come up; that failure has no sensible fallback.
    pub fn new(heap_base: usize, heap_len: u32, link_base: usize, policy: Policy, page_source: PS) -> Self {
        let mut arena = PageArena::new(page_source);
        arena.begin_bootstrap();
        let nil_a = arena.alloc().expect("kh: failed to seed address-tree sentinel");
        let root_a = arena.alloc().expect("kh: failed to seed address-tree root");
        let nil_s = arena.alloc().expect("kh: failed to seed size-tree sentinel");
        let root_s = arena.alloc().expect("kh: failed to seed size-tree root");
        arena.end_bootstrap();

        let whole = Node::new(0, heap_len, true);
        let addr_tree: RbTree<ByAddr> = unsafe { RbTree::new(link_base, nil_a, root_a, whole) };
        let size_tree: RbTree<BySize> = unsafe { RbTree::new(link_base, nil_s, root_s, whole) };
        let last = addr_tree.root();

        Self {
            heap_base,
            heap_len,
            policy,
            trees: Mutex::new(TreeState { addr_tree, size_tree, last }),
            arena: Mutex::new(arena),
        }
    }

    /// Allocate `nbytes` bytes. Returns `None` on exhaustion; a request for zero bytes
    /// also returns `None`, since it is not an error but has nothing to hand back.
    pub fn alloc(&self, nbytes: u32) -> Option<HeapPtr> {
        if nbytes == 0 {
            return None;
        }
        let mut trees = self.trees.lock();
        let candidate = self.select(&mut trees, nbytes)?;
        let addr = self.split(&mut trees, candidate, nbytes)?;
        Some(HeapPtr(self.heap_base + addr as usize))
    }

    fn select(&self, trees: &mut TreeState, nbytes: u32) -> Option<i32> {
        match self.policy {
            Policy::FirstFit => self.first_fit(trees, nbytes),
            Policy::NextFit => self.next_fit(trees, nbytes),
            Policy::BestFit => self.best_fit(trees, nbytes),
            Policy::WorstFit => self.worst_fit(trees, nbytes),
        }
    }

    fn first_fit(&self, trees: &TreeState, nbytes: u32) -> Option<i32> {
        let nil = trees.addr_tree.nil();
        let mut cur = trees.addr_tree.min();
        while cur != nil {
            let n = unsafe { trees.addr_tree.payload(cur) };
            if n.is_free() && n.size() >= nbytes {
                return Some(cur);
            }
            cur = trees.addr_tree.step(cur);
        }
        None
    }

    fn next_fit(&self, trees: &mut TreeState, nbytes: u32) -> Option<i32> {
        let nil = trees.addr_tree.nil();
        if trees.addr_tree.count() == 0 {
            return None;
        }
        let start = if trees.last == nil { trees.addr_tree.min() } else { trees.last };
        let mut cur = start;
        loop {
            let n = unsafe { trees.addr_tree.payload(cur) };
            if n.is_free() && n.size() >= nbytes {
                let next = trees.addr_tree.step(cur);
                trees.last = if next == nil { trees.addr_tree.min() } else { next };
                return Some(cur);
            }
            let next = trees.addr_tree.step(cur);
            cur = if next == nil { trees.addr_tree.min() } else { next };
            if cur == start {
                return None;
            }
        }
    }

    fn best_fit(&self, trees: &TreeState, nbytes: u32) -> Option<i32> {
        let nil = trees.size_tree.nil();
        let mut cur = trees.size_tree.min();
        while cur != nil {
            let n = unsafe { trees.size_tree.payload(cur) };
            if n.is_free() && n.size() >= nbytes {
                return Some(trees.addr_tree.find(&Node::new(n.addr(), n.size(), true)));
            }
            cur = trees.size_tree.step(cur);
        }
        None
    }

    fn worst_fit(&self, trees: &TreeState, nbytes: u32) -> Option<i32> {
        let nil = trees.size_tree.nil();
        let mut cur = trees.size_tree.max();
        while cur != nil {
            let n = unsafe { trees.size_tree.payload(cur) };
            if n.is_free() {
                return if n.size() >= nbytes {
                    Some(trees.addr_tree.find(&Node::new(n.addr(), n.size(), true)))
                } else {
                    None
                };
            }
            cur = trees.size_tree.step_back(cur);
        }
        None
    }

    fn size_peer(&self, trees: &TreeState, addr: u32, size: u32) -> i32 {
        trees.size_tree.find(&Node::new(addr, size, true))
    }

    fn arena_slot(&self) -> Option<core::ptr::NonNull<Node>> {
        self.arena.lock().alloc()
    }

    /// Split `nbytes` off the high end of the free block at `candidate`, marking the
    /// result allocated. Returns the relative address of the carved block, or `None` if
    /// a new tree-node slot was needed and the arena could not supply one (the free
    /// block itself is left untouched on that path).
    fn split(&self, trees: &mut TreeState, candidate: i32, nbytes: u32) -> Option<u32> {
        let (c_addr, c_size) = {
            let n = unsafe { trees.addr_tree.payload(candidate) };
            (n.addr(), n.size())
        };

        if c_size == nbytes {
            unsafe { trees.addr_tree.payload_mut(candidate).set_free(false) };
            let peer = self.size_peer(trees, c_addr, c_size);
            unsafe { trees.size_tree.payload_mut(peer).set_free(false) };
            return Some(c_addr);
        }

        let new_size = c_size - nbytes;
        let size_off = self.size_peer(trees, c_addr, c_size);
        let freed_size_slot = trees.size_tree.remove(size_off);
        unsafe { trees.addr_tree.payload_mut(candidate).size = new_size };
        unsafe { freed_size_slot.as_ptr().write(Node::new(c_addr, new_size, true)) };
        trees.size_tree.insert(freed_size_slot);

        let tail_addr = c_addr + new_size;
        let tail = Node::new(tail_addr, nbytes, false);

        let addr_slot = self.arena_slot()?;
        unsafe { addr_slot.as_ptr().write(tail) };
        trees.addr_tree.insert(addr_slot);

        let size_slot = match self.arena_slot() {
            Some(s) => s,
            None => {
                let off = trees.addr_tree.offset_of(addr_slot);
                let freed = trees.addr_tree.remove(off);
                self.arena.lock().free(freed);
                // undo the shrink too, so the caller sees the block exactly as before.
                let size_off = self.size_peer(trees, c_addr, new_size);
                let shrunk_slot = trees.size_tree.remove(size_off);
                unsafe { shrunk_slot.as_ptr().write(Node::new(c_addr, c_size, true)) };
                trees.size_tree.insert(shrunk_slot);
                unsafe { trees.addr_tree.payload_mut(candidate).size = c_size };
                return None;
            }
        };
        unsafe { size_slot.as_ptr().write(tail) };
        trees.size_tree.insert(size_slot);

        Some(tail_addr)
    }

    fn fields(&self, trees: &TreeState, off: i32) -> (u32, u32, bool) {
        let n = unsafe { trees.addr_tree.payload(off) };
        (n.addr(), n.size(), n.is_free())
    }

    /// Remove the block at `addr_off` from both trees and return its two node slots to
    /// the arena.
    fn detach(&self, trees: &mut TreeState, addr_off: i32, addr: u32, size: u32) {
        let size_off = self.size_peer(trees, addr, size);
        let size_slot = trees.size_tree.remove(size_off);
        self.arena.lock().free(size_slot);
        let addr_slot = trees.addr_tree.remove(addr_off);
        self.arena.lock().free(addr_slot);
    }

    /// Free a block previously returned by [`HeapAllocator::alloc`], coalescing it with
    /// any address-adjacent free neighbors.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is outside this heap, does not name a live block, or names a
    /// block that is already free (a double free) — these are all programmer errors,
    /// not conditions a caller can recover from.
    pub fn free(&self, ptr: HeapPtr) {
        let rel = ptr
            .addr()
            .checked_sub(self.heap_base)
            .filter(|r| *r < self.heap_len as usize)
            .unwrap_or_else(|| panic!("kh: free of {:#x}, outside the heap", ptr.addr())) as u32;

        let mut trees = self.trees.lock();
        let nil = trees.addr_tree.nil();

        let cur = trees.addr_tree.find(&Node::new(rel, 0, true));
        if cur == nil {
            panic!("kh: free of {:#x}, no such block", rel);
        }
        if unsafe { trees.addr_tree.payload(cur).is_free() } {
            panic!("kh: double free of block at {:#x}", rel);
        }

        unsafe { trees.addr_tree.payload_mut(cur).set_free(true) };
        let (cur_addr, cur_size) = self.fields(&trees, cur);
        let peer = self.size_peer(&trees, cur_addr, cur_size);
        unsafe { trees.size_tree.payload_mut(peer).set_free(true) };

        let mut owner = cur;
        let mut owner_key = (cur_addr, cur_size);
        let mut new_addr = cur_addr;
        let mut new_size = cur_size;
        let mut merged = false;

        let succ = trees.addr_tree.step(cur);
        if succ != nil {
            let (s_addr, s_size, s_free) = self.fields(&trees, succ);
            if s_free && new_addr + new_size == s_addr {
                self.detach(&mut trees, succ, s_addr, s_size);
                new_size += s_size;
                merged = true;
            }
        }

        let pred = trees.addr_tree.step_back(cur);
        if pred != nil {
            let (p_addr, p_size, p_free) = self.fields(&trees, pred);
            if p_free && p_addr + p_size == new_addr {
                self.detach(&mut trees, cur, cur_addr, cur_size);
                new_addr = p_addr;
                new_size += p_size;
                owner = pred;
                owner_key = (p_addr, p_size);
                merged = true;
            }
        }

        if merged {
            let size_off = self.size_peer(&trees, owner_key.0, owner_key.1);
            let slot = trees.size_tree.remove(size_off);
            unsafe {
                trees.addr_tree.payload_mut(owner).addr = new_addr;
                trees.addr_tree.payload_mut(owner).size = new_size;
            }
            unsafe { slot.as_ptr().write(Node::new(new_addr, new_size, true)) };
            trees.size_tree.insert(slot);
        }
    }

    /// Log every block in address order, for diagnostics.
    pub fn print_blocks(&self) {
        let trees = self.trees.lock();
        let nil = trees.addr_tree.nil();
        let mut cur = trees.addr_tree.min();
        while cur != nil {
            let n = unsafe { trees.addr_tree.payload(cur) };
            log::debug!(
                "block addr={:#x} size={:#x} free={}",
                n.addr(),
                n.size(),
                n.is_free()
            );
            cur = trees.addr_tree.step(cur);
        }
    }

    /// Run the diagnostic checks from [`crate::rb::RbTree::check_violation`] against
    /// both trees and cross-check their block sets agree.
    ///
    /// Agreement means: same number of blocks, and the address tree's in-order walk
    /// yields exactly the `(addr, size, is_free)` triples the size tree holds, modulo
    /// order. Since both trees are built from the same underlying blocks, this also
    /// catches a tree that has silently lost or duplicated an entry during coalescing.
    pub fn check_invariants(&self) -> Result<(), crate::error::RbViolation> {
        let trees = self.trees.lock();
        trees.addr_tree.check_violation()?;
        trees.size_tree.check_violation()?;

        if trees.addr_tree.count() != trees.size_tree.count() {
            return Err(crate::error::RbViolation::TreesDisagree);
        }

        let nil = trees.addr_tree.nil();
        let mut cur = trees.addr_tree.min();
        while cur != nil {
            let n = unsafe { trees.addr_tree.payload(cur) };
            let peer = trees.size_tree.find(&Node::new(n.addr(), n.size(), true));
            if peer == trees.size_tree.nil() {
                return Err(crate::error::RbViolation::TreesDisagree);
            }
            let peer_n = unsafe { trees.size_tree.payload(peer) };
            if peer_n.is_free() != n.is_free() {
                return Err(crate::error::RbViolation::TreesDisagree);
            }
            cur = trees.addr_tree.step(cur);
        }

        Ok(())
    }

    #[cfg(test)]
    fn blocks(&self) -> std::vec::Vec<(u32, u32, bool)> {
        let trees = self.trees.lock();
        let nil = trees.addr_tree.nil();
        let mut out = std::vec::Vec::new();
        let mut cur = trees.addr_tree.min();
        while cur != nil {
            let n = unsafe { trees.addr_tree.payload(cur) };
            out.push((n.addr(), n.size(), n.is_free()));
            cur = trees.addr_tree.step(cur);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::error::PageSourceError;
    use core::ptr::NonNull;
    use std::alloc::{alloc, dealloc, Layout};
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    struct TestPageSource {
        layout: Layout,
        live: StdMutex<Vec<NonNull<u8>>>,
    }

    impl TestPageSource {
        fn new() -> Self {
            Self {
                layout: Layout::from_size_align(crate::platform::PAGE_SIZE, crate::platform::PAGE_SIZE).unwrap(),
                live: StdMutex::new(Vec::new()),
            }
        }
    }

    impl PageSource for TestPageSource {
        fn allocate(&self) -> Result<NonNull<u8>, PageSourceError> {
            let ptr = unsafe { alloc(self.layout) };
            let nn = NonNull::new(ptr).ok_or(PageSourceError::NoPagesAvailable)?;
            self.live.lock().unwrap().push(nn);
            Ok(nn)
        }

        unsafe fn deallocate(&self, page: NonNull<u8>) {
            self.live.lock().unwrap().retain(|p| *p != page);
            dealloc(page.as_ptr(), self.layout);
        }
    }

    impl Drop for TestPageSource {
        fn drop(&mut self) {
            for p in self.live.lock().unwrap().drain(..) {
                unsafe { dealloc(p.as_ptr(), self.layout) };
            }
        }
    }

    fn heap(policy: Policy, len: u32) -> HeapAllocator<TestPageSource> {
        // link_base independent of heap_base: the tree nodes live in arena pages, not
        // in the heap region itself, which is the point of the out-of-band design.
        HeapAllocator::new(0x1000_0000, len, 0x2000_0000, policy, TestPageSource::new())
    }

    #[test]
    fn smoke_ladder_alloc_free_alloc() {
        let h = heap(Policy::FirstFit, 4096);
        let a = h.alloc(64).unwrap();
        let b = h.alloc(128).unwrap();
        assert_ne!(a.addr(), b.addr());
        h.free(a);
        let c = h.alloc(32).unwrap();
        assert!(c.addr() >= 0x1000_0000);
        h.check_invariants().unwrap();
    }

    #[test]
    fn exact_fit_does_not_split() {
        let h = heap(Policy::FirstFit, 256);
        let a = h.alloc(256).unwrap();
        assert_eq!(h.blocks(), std::vec![(0, 256, false)]);
        h.free(a);
        assert_eq!(h.blocks(), std::vec![(0, 256, true)]);
    }

    #[test]
    fn next_fit_resumes_after_previous_allocation() {
        let h = heap(Policy::NextFit, 4096);
        let first = h.alloc(256).unwrap();
        let second = h.alloc(256).unwrap();
        assert!(second.addr() > first.addr());
    }

    #[test]
    fn best_fit_chooses_the_tightest_block() {
        let h = heap(Policy::BestFit, 4096);
        let x = h.alloc(3000).unwrap();
        let a = h.alloc(500).unwrap();
        let _b = h.alloc(500).unwrap();
        // leaves a 96-byte sliver at the bottom and, once x and a merge, a 3500-byte
        // free block above it.
        h.free(x);
        h.free(a);
        assert_eq!(h.blocks().len(), 3);

        let small_hole = h.alloc(50).unwrap();
        assert_eq!(small_hole.addr(), 0x1000_0000 + 46);
    }

    #[test]
    fn coalesces_with_both_neighbors() {
        let h = heap(Policy::FirstFit, 4096);
        let a = h.alloc(256).unwrap();
        let b = h.alloc(256).unwrap();
        let c = h.alloc(256).unwrap();
        h.free(a);
        h.free(c);
        h.free(b);
        assert_eq!(h.blocks(), std::vec![(0, 4096, true)]);
        h.check_invariants().unwrap();
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let h = heap(Policy::FirstFit, 4096);
        let a = h.alloc(64).unwrap();
        h.free(a);
        h.free(a);
    }

    #[test]
    fn exhaustion_returns_none_not_a_panic() {
        let h = heap(Policy::FirstFit, 256);
        assert!(h.alloc(512).is_none());
        assert!(h.alloc(0).is_none());
    }

    #[test]
    fn grows_the_arena_across_many_small_allocations() {
        let h = heap(Policy::FirstFit, 1 << 20);
        let mut ptrs = Vec::new();
        for _ in 0..300 {
            ptrs.push(h.alloc(16).unwrap());
        }
        h.check_invariants().unwrap();
        for p in ptrs {
            h.free(p);
        }
        assert_eq!(h.blocks(), std::vec![(0, 1 << 20, true)]);
    }
}
