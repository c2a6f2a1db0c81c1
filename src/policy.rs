//! Block-selection policies for [`crate::kh`].

/// Which free block a request for `n` bytes is satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The first free block, in address order, that is large enough.
    FirstFit,
    /// Like [`Policy::FirstFit`], but resumes scanning from the block after the one
    /// satisfying the previous request instead of restarting at the lowest address.
    NextFit,
    /// The smallest free block that is still large enough.
    BestFit,
    /// The largest free block available.
    WorstFit,
}
