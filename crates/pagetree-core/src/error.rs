//! Error types for the index core.

use thiserror::Error;

use crate::btree::PageId;

/// Result alias used across the crate.
pub type TreeResult<T> = std::result::Result<T, TreeError>;

/// Main error type for tree operations and the page codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// A key exceeded the per-entry bound at encode time.
    #[error("key in slot {index} is {len} bytes, exceeding the {max} byte maximum")]
    KeyTooLarge { index: usize, len: usize, max: usize },

    /// A value exceeded the per-entry bound at encode time.
    #[error("value in slot {index} is {len} bytes, exceeding the {max} byte maximum")]
    ValueTooLarge { index: usize, len: usize, max: usize },

    /// A node carries more keys or children than its order permits.
    #[error("node carries {count} {kind} but order {order} allows at most {max}")]
    NodeTooWide {
        count: usize,
        kind: &'static str,
        order: u8,
        max: usize,
    },

    /// A page buffer is not exactly one page long.
    #[error("page is {len} bytes, expected exactly {expected}")]
    PageSizeMismatch { len: usize, expected: usize },

    /// A page failed to decode under the fixed layout.
    #[error("corrupt page: {reason}")]
    CorruptPage { reason: String },

    /// A full node of this order cannot fit in one page.
    #[error("order {order} cannot encode: a full node needs {required} bytes but a page holds {page_size}")]
    OrderTooLarge {
        order: u8,
        required: usize,
        page_size: usize,
    },

    /// Branching factors below 3 have no meaningful split point.
    #[error("order {0} is below the minimum branching factor of 3")]
    OrderTooSmall(u8),

    /// The page store returned nothing for a page the tree references.
    #[error("page {0} could not be resolved by the page store")]
    UnresolvedPage(PageId),

    /// A leaf turned up where the tree shape requires an internal node.
    #[error("page {0} holds a leaf where an internal node was expected")]
    ExpectedInternal(PageId),

    /// An internal node turned up where the tree shape requires a leaf.
    #[error("page {0} holds an internal node where a leaf was expected")]
    ExpectedLeaf(PageId),

    /// A structural invariant did not hold while rebalancing.
    #[error("tree invariant violated at page {page}: {reason}")]
    Invariant { page: PageId, reason: &'static str },
}
