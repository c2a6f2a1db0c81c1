use core::fmt::Debug;

#[cfg(feature = "alloc")]
use alloc::boxed::Box;

/// `BaseError` is a common trait implemented by every error type in this crate.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing with errors.
/// [`GenericError`] is defined using this trait when paired with a global allocator (required
/// for trait objects).
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and don't need to return
/// anything on success.
///
/// # Examples:
///
/// ```
/// use rbkalloc::error::CanFail;
///
/// struct InitError;
///
/// fn init_component() -> CanFail<InitError> {
///     Ok(())
/// }
/// ```
pub type CanFail<T> = Result<(), T>;

/// `GenericError` is a return type for functions that do not raise specific / usual known errors.
#[cfg(feature = "alloc")]
pub type GenericError = Result<(), Box<dyn BaseError>>;

#[cfg(not(feature = "alloc"))]
pub type GenericError = Result<(), ()>;

/// Failure modes of the external page source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSourceError {
    /// The collaborator has no more pages to hand out.
    NoPagesAvailable,
}

impl BaseError for PageSourceError {}

/// Red-black tree invariant violations surfaced by `check_violation`.
///
/// These never occur as a result of correct use of this crate; they exist so that
/// diagnostic/fuzzing code can assert the allocator's internal bookkeeping stayed
/// consistent, the way `kh_print_blocks` does in the original design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RbViolation {
    /// The root of the tree is colored red.
    RedRoot,
    /// A red node has a red child.
    RedRedEdge,
    /// Two root-to-leaf paths disagree on the number of black nodes crossed.
    UnequalBlackHeight,
    /// The address tree and size tree disagree on the set of blocks they index.
    TreesDisagree,
}

impl BaseError for RbViolation {}
