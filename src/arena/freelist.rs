//! The intra-chain free-list allocator.
//!
//! Each chain carries exactly one allocator whose bookkeeping lives inside
//! the chain itself: the [`AllocatorHeader`] after the prefix anchors a
//! doubly-linked list of free [`BlockHeader`]s, ordered by ascending chain
//! position. Allocation is first-fit with splitting; deallocation inserts
//! at the sorted position and coalesces with position-adjacent neighbours
//! in the same segment.
//!
//! All functions here require the chain's allocator mutex to be held by
//! the caller; the [`Manager`] front door is the only caller. Blocks are
//! addressed by chain position and resolved through the manager for each
//! access, so nothing here holds a reference across a grow.

use eyre::Result;

use super::block::{AllocatorHeader, BlockHeader, ALLOCATOR_HEADER_SIZE, BLOCK_HEADER_SIZE};
use super::manager::{ChainId, Manager};
use super::{align_up, BLOCK_ALIGN};

/// Position-keyed view of one chain's free list.
pub(crate) struct FreeList<'a> {
    manager: &'a Manager,
    chain: ChainId,
    header_pos: u64,
}

impl<'a> FreeList<'a> {
    /// The caller must hold `chain`'s allocator mutex for the lifetime of
    /// the returned value.
    pub fn new(manager: &'a Manager, chain: ChainId, prefix_len: u64) -> Self {
        Self {
            manager,
            chain,
            header_pos: align_up(prefix_len, BLOCK_ALIGN),
        }
    }

    fn header(&self) -> Result<&'a mut AllocatorHeader> {
        let addr = self
            .manager
            .address_in_chain(self.chain, self.header_pos, ALLOCATOR_HEADER_SIZE)?;
        // SAFETY: the allocator header never crosses a segment boundary
        // (checked by the length-qualified lookup above) and the allocator
        // mutex held by our caller is the only writer.
        Ok(unsafe { &mut *(addr as *mut AllocatorHeader) })
    }

    fn block(&self, position: u64) -> Result<&'a mut BlockHeader> {
        let addr = self
            .manager
            .address_in_chain(self.chain, position, BLOCK_HEADER_SIZE)?;
        // SAFETY: as for header(); block headers never straddle segments.
        Ok(unsafe { &mut *(addr as *mut BlockHeader) })
    }

    /// First-fit allocation of `user_bytes` (already rounded to the block
    /// granule). Returns the position of the detached block's header.
    pub fn acquire(&self, user_bytes: u64) -> Result<u64> {
        let mut cursor = self.header()?.first_free();
        let mut found = None;
        while let Some(position) = cursor {
            let block = self.block(position)?;
            if block.size() >= user_bytes {
                found = Some(position);
                break;
            }
            cursor = block.next_pos();
        }

        let position = match found {
            Some(position) => position,
            None => self.grow(user_bytes)?,
        };

        // Carve off the tail when the leftover can hold another header;
        // otherwise the whole block is handed out.
        if self.block(position)?.size() >= user_bytes + BLOCK_HEADER_SIZE {
            let second = self.split(position, user_bytes)?;
            let header = self.header()?;
            if header.last_free() == Some(position) {
                header.set_last_free(Some(second));
            }
        }

        self.detach(position)?;
        Ok(position)
    }

    /// Returns the freed block at `position` to the list and coalesces.
    pub fn release(&self, position: u64) -> Result<()> {
        // Find the first free block past the freed one. Insertion keeps
        // the list sorted by position.
        let mut right = self.header()?.first_free();
        while let Some(candidate) = right {
            if candidate > position {
                break;
            }
            right = self.block(candidate)?.next_pos();
        }
        let left = match right {
            Some(candidate) => self.block(candidate)?.prev_pos(),
            None => self.header()?.last_free(),
        };

        self.attach(position, left, right)?;
        self.coalesce(position)
    }

    /// Walks the free list in order, reporting `(position, size)` pairs.
    pub fn blocks(&self) -> Result<Vec<(u64, u64)>> {
        let mut out = Vec::new();
        let mut cursor = self.header()?.first_free();
        while let Some(position) = cursor {
            let block = self.block(position)?;
            out.push((position, block.size()));
            cursor = block.next_pos();
        }
        Ok(out)
    }

    /// Extends the chain by a fresh segment and returns the position of
    /// the single free block spanning it, already spliced in as the list
    /// tail (the new block has the highest position in the chain).
    fn grow(&self, user_bytes: u64) -> Result<u64> {
        let (start, segment_len) = self
            .manager
            .grow_chain(self.chain, user_bytes + BLOCK_HEADER_SIZE)?;
        self.block(start)?.init_free(segment_len - BLOCK_HEADER_SIZE);
        let tail = self.header()?.last_free();
        self.attach(start, tail, None)?;
        Ok(start)
    }

    /// Shrinks the block at `position` to `keep_bytes` of user data and
    /// wires the remainder in as a new free block directly after it.
    fn split(&self, position: u64, keep_bytes: u64) -> Result<u64> {
        let second_pos = position + BLOCK_HEADER_SIZE + keep_bytes;
        let (old_size, old_next) = {
            let block = self.block(position)?;
            (block.size(), block.next_pos())
        };

        {
            let second = self.block(second_pos)?;
            second.set_size(old_size - keep_bytes - BLOCK_HEADER_SIZE);
            second.set_prev_pos(Some(position));
            second.set_next_pos(old_next);
        }
        if let Some(next) = old_next {
            self.block(next)?.set_prev_pos(Some(second_pos));
        }

        let block = self.block(position)?;
        block.set_size(keep_bytes);
        block.set_next_pos(Some(second_pos));
        Ok(second_pos)
    }

    /// Links the block at `position` between `left` and `right`, updating
    /// the list anchors when it becomes an endpoint.
    fn attach(&self, position: u64, left: Option<u64>, right: Option<u64>) -> Result<()> {
        {
            let block = self.block(position)?;
            block.set_prev_pos(left);
            block.set_next_pos(right);
        }
        if let Some(left) = left {
            self.block(left)?.set_next_pos(Some(position));
        }
        if let Some(right) = right {
            self.block(right)?.set_prev_pos(Some(position));
        }

        let header = self.header()?;
        if header.first_free() == right {
            header.set_first_free(Some(position));
        }
        if header.last_free() == left {
            header.set_last_free(Some(position));
        }
        Ok(())
    }

    /// Unlinks the block at `position`, nulling its own links and fixing
    /// the anchors when it was an endpoint.
    fn detach(&self, position: u64) -> Result<()> {
        let (left, right) = {
            let block = self.block(position)?;
            (block.prev_pos(), block.next_pos())
        };
        if let Some(left) = left {
            self.block(left)?.set_next_pos(right);
        }
        if let Some(right) = right {
            self.block(right)?.set_prev_pos(left);
        }
        {
            let block = self.block(position)?;
            block.set_prev_pos(None);
            block.set_next_pos(None);
        }

        let header = self.header()?;
        if header.first_free() == Some(position) {
            header.set_first_free(right);
        }
        if header.last_free() == Some(position) {
            header.set_last_free(left);
        }
        Ok(())
    }

    /// Merges the run of position-adjacent free blocks around `position`.
    /// Merging never crosses a segment boundary.
    fn coalesce(&self, position: u64) -> Result<()> {
        let mut first = position;
        loop {
            let prev = self.block(first)?.prev_pos();
            match prev {
                Some(prev) if self.adjacent(prev, first)? => first = prev,
                _ => break,
            }
        }

        let mut last = first;
        loop {
            let next = self.block(first)?.next_pos();
            let next = match next {
                Some(next) if self.adjacent(first, next)? => next,
                _ => break,
            };
            let (next_size, after) = {
                let absorbed = self.block(next)?;
                (absorbed.size(), absorbed.next_pos())
            };
            {
                let block = self.block(first)?;
                block.set_size(block.size() + BLOCK_HEADER_SIZE + next_size);
                block.set_next_pos(after);
            }
            if let Some(after) = after {
                self.block(after)?.set_prev_pos(Some(first));
            }
            last = next;
        }

        // An absorbed tail leaves the anchor pointing into dead space.
        if last != first {
            let header = self.header()?;
            if header.last_free() == Some(last) {
                header.set_last_free(Some(first));
            }
        }
        Ok(())
    }

    /// Whether the block at `left` ends exactly where `right` begins, with
    /// both in the same segment.
    fn adjacent(&self, left: u64, right: u64) -> Result<bool> {
        if left + BLOCK_HEADER_SIZE + self.block(left)?.size() != right {
            return Ok(false);
        }
        self.manager.same_segment(self.chain, left, right)
    }
}
