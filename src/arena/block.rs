//! On-chain header structs for the free-list allocator.
//!
//! Two structures live at fixed, position-addressed places inside every
//! chain. The [`AllocatorHeader`] sits immediately after the user prefix
//! and anchors the free list. A [`BlockHeader`] precedes every allocated
//! or free region; its `prev`/`next` chain pointers doubly-link the free
//! list and are null while the block is allocated.
//!
//! ## Block Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -----------------------------------------------
//! 0       8     prev: chain position of previous free block (BE)
//! 8       8     next: chain position of next free block (BE)
//! 16      8     size: user bytes after this header (BE)
//! 24      ...   user data
//! ```
//!
//! Free-list invariants, maintained by the allocator under the chain's
//! mutex:
//!
//! - free blocks are linked in ascending chain position
//! - the head block has null `prev`, the tail block has null `next`
//! - no two free blocks are ever position-adjacent within one segment
//! - a block with a non-null `prev` or `next` is free
//!
//! Blocks never straddle a segment boundary, so a block's header and user
//! data are always contiguous in memory.

use std::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::endian::U64Be;
use super::ptr::ChainPtr;

/// Bytes occupied by a [`BlockHeader`]. User data starts this many bytes
/// after the block's position.
pub const BLOCK_HEADER_SIZE: u64 = 24;

/// Bytes occupied by an [`AllocatorHeader`].
pub const ALLOCATOR_HEADER_SIZE: u64 = 16;

/// Header preceding every block in a chain.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockHeader {
    /// Previous free block. Null while the block is allocated.
    prev: ChainPtr<BlockHeader>,
    /// Next free block. Null while the block is allocated.
    next: ChainPtr<BlockHeader>,
    /// Size of the block in bytes, not counting this header. Meaningful
    /// for free and allocated blocks alike.
    size: U64Be,
}

const _: () = assert!(size_of::<BlockHeader>() == BLOCK_HEADER_SIZE as usize);

impl BlockHeader {
    pub fn size(&self) -> u64 {
        self.size.get()
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.size.set(size);
    }

    pub(crate) fn prev_pos(&self) -> Option<u64> {
        self.prev.position()
    }

    pub(crate) fn set_prev_pos(&mut self, position: Option<u64>) {
        self.prev.set_position(position);
    }

    pub(crate) fn next_pos(&self) -> Option<u64> {
        self.next.position()
    }

    pub(crate) fn set_next_pos(&mut self, position: Option<u64>) {
        self.next.set_position(position);
    }

    /// Whether the block is off the free list, as allocated blocks are.
    pub fn is_detached(&self) -> bool {
        self.prev.is_null() && self.next.is_null()
    }

    /// Formats this header as a lone free block of `size` user bytes.
    pub(crate) fn init_free(&mut self, size: u64) {
        self.prev = ChainPtr::NULL;
        self.next = ChainPtr::NULL;
        self.size.set(size);
    }
}

/// Anchor of a chain's free list, stored right after the prefix.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AllocatorHeader {
    /// First (lowest-position) free block, or null if none.
    first_free: ChainPtr<BlockHeader>,
    /// Last (highest-position) free block, or null if none.
    last_free: ChainPtr<BlockHeader>,
}

const _: () = assert!(size_of::<AllocatorHeader>() == ALLOCATOR_HEADER_SIZE as usize);

impl AllocatorHeader {
    pub(crate) fn first_free(&self) -> Option<u64> {
        self.first_free.position()
    }

    pub(crate) fn set_first_free(&mut self, position: Option<u64>) {
        self.first_free.set_position(position);
    }

    pub(crate) fn last_free(&self) -> Option<u64> {
        self.last_free.position()
    }

    pub(crate) fn set_last_free(&mut self, position: Option<u64>) {
        self.last_free.set_position(position);
    }

    /// Formats a fresh header whose free list holds the single block at
    /// `first_block`.
    pub(crate) fn init(&mut self, first_block: u64) {
        self.first_free.set_position(Some(first_block));
        self.last_free.set_position(Some(first_block));
    }
}
