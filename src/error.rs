//! Error types for mmarena.
//!
//! Every fallible operation in the crate returns `eyre::Result`. Failures
//! that callers are expected to branch on are raised as [`ArenaError`]
//! values, so they can be recovered from the report with
//! `Report::downcast_ref::<ArenaError>()`. OS-level failures (mapping,
//! file truncation) are wrapped with operation context and surfaced
//! unchanged.

use thiserror::Error;

use crate::arena::{ChainId, MAX_PREFIX_SIZE};

/// The typed failure modes of chain and pointer operations.
#[derive(Error, Debug)]
pub enum ArenaError {
    /// An address or position was claimed to be inside a chain but is not.
    #[error("not inside any chain: {0}")]
    OutOfChain(String),

    /// A length-qualified lookup straddles a segment boundary.
    #[error("range at position {position} (+{len} bytes) crosses a segment boundary in chain {chain}")]
    CrossSegment {
        /// The chain the lookup ran against.
        chain: ChainId,
        /// Starting position of the requested range.
        position: u64,
        /// Requested contiguous length.
        len: u64,
    },

    /// A chain pointer and its target live in different chains.
    #[error("pointer in chain {pointer_chain} cannot reference an address in chain {target_chain}")]
    ChainMismatch {
        /// The chain containing the pointer itself.
        pointer_chain: ChainId,
        /// The chain containing the would-be target.
        target_chain: ChainId,
    },

    /// A null chain pointer was dereferenced.
    #[error("dereferenced a null chain pointer")]
    NullDeref,

    /// A non-empty backing file does not start with the declared prefix.
    #[error("file prefix mismatch: expected {expected:?}, found {found:?}")]
    PrefixMismatch {
        /// The prefix the caller declared.
        expected: Vec<u8>,
        /// The bytes actually at the start of the file.
        found: Vec<u8>,
    },

    /// A chain is too small to contain a root object of the requested size.
    #[error("chain {chain} holds {actual} bytes, fewer than the {required} required for its root")]
    RootShape {
        /// The chain that was queried.
        chain: ChainId,
        /// Bytes required through the end of the root object.
        required: u64,
        /// Total size of the chain.
        actual: u64,
    },

    /// A chain id does not name a live chain.
    #[error("no such chain: {0}")]
    UnknownChain(ChainId),

    /// A prefix longer than the fixed limit was supplied.
    #[error("prefix of {0} bytes exceeds the {limit} byte limit", limit = MAX_PREFIX_SIZE)]
    PrefixTooLong(usize),
}
