//! # Chain Manager
//!
//! The manager owns every chain in the process. It keeps two mutually
//! consistent, address-ordered indexes under one readers-writer lock:
//!
//! - per chain, an ordered map from *starting position* to the segment
//!   span mapped there
//! - globally, an ordered map from *base virtual address* to a link
//!   record naming the chain, starting position, and length
//!
//! Predecessor searches over these maps answer the two questions
//! everything else is built on: "which chain and position is this address"
//! and "which address is this chain position". Chain pointers resolve
//! through the second; allocation-from-an-address resolves through the
//! first.
//!
//! ## Lifecycle
//!
//! Chains are created anonymous, created over a file, copied (to
//! anonymous memory or onto a file), grown, and destroyed. A chain's
//! segments are mapped once and never move; growth appends a segment at
//! the current total size, sized `align_up(max(total, needed), BASE_SIZE)`
//! so repeated growth stays geometric with a floor. For file-backed chains
//! growth extends the file first and maps only the new byte range.
//!
//! ## Locking
//!
//! Lookups take the index lock shared; lifecycle operations take it
//! exclusive. Allocate and deallocate additionally hold the chain's
//! allocator mutex for their whole run, and a grow from inside an
//! allocation acquires the index write lock *while* holding that mutex.
//! That order (allocator mutex, then index lock) is the lock hierarchy;
//! nothing acquires them the other way around.
//!
//! ## File Ownership
//!
//! A file-backed chain owns its `File`. Destroying the chain flushes the
//! mapped segments and closes the handle. Callers that need the handle
//! afterwards should pass a `try_clone`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};

use crate::error::ArenaError;

use super::block::{AllocatorHeader, BlockHeader, ALLOCATOR_HEADER_SIZE, BLOCK_HEADER_SIZE};
use super::freelist::FreeList;
use super::segment::Segment;
use super::{align_up, BASE_SIZE, BLOCK_ALIGN, MAX_PREFIX_SIZE};

/// Opaque identifier of a live chain. The zero value, [`ChainId::NONE`],
/// names no chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(u64);

impl ChainId {
    /// The sentinel for "no chain".
    pub const NONE: ChainId = ChainId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static GLOBAL: Lazy<Manager> = Lazy::new(Manager::new);

/// Process-wide owner of all chains and their segment indexes.
pub struct Manager {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Registry {
    chains: HashMap<ChainId, ChainState>,
    by_address: BTreeMap<usize, LinkRecord>,
}

struct ChainState {
    /// Starting position -> mapped span, ordered for predecessor search.
    spans: BTreeMap<u64, Span>,
    /// The mappings themselves; dropping a state unmaps every segment.
    segments: SmallVec<[Segment; 4]>,
    total_size: u64,
    prefix_len: u64,
    /// Backing file, if any. Held for growth and closed on destroy.
    file: Option<File>,
    /// Serializes allocate/deallocate/grow for this chain.
    alloc_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    base: usize,
    len: u64,
}

#[derive(Debug, Clone, Copy)]
struct LinkRecord {
    chain: ChainId,
    start: u64,
    len: u64,
}

/// Fixed offsets derived from a prefix length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChainLayout {
    pub header_pos: u64,
    pub first_block: u64,
    pub root_pos: u64,
}

impl ChainLayout {
    fn new(prefix_len: usize) -> Result<Self> {
        if prefix_len > MAX_PREFIX_SIZE {
            return Err(ArenaError::PrefixTooLong(prefix_len).into());
        }
        Ok(Self::for_prefix_len(prefix_len as u64))
    }

    pub(crate) fn for_prefix_len(prefix_len: u64) -> Self {
        let header_pos = align_up(prefix_len, BLOCK_ALIGN);
        let first_block = header_pos + ALLOCATOR_HEADER_SIZE;
        Self {
            header_pos,
            first_block,
            root_pos: first_block + BLOCK_HEADER_SIZE,
        }
    }

    fn initial_segment_len(&self, root_bytes: u64) -> u64 {
        let needed = self.root_pos + align_up(root_bytes, BLOCK_ALIGN);
        align_up(needed.max(BASE_SIZE), BASE_SIZE)
    }

    /// Writes the prefix, a fresh allocator header, and one maximal free
    /// block into an unregistered segment of `segment_len` bytes.
    ///
    /// # Safety
    ///
    /// `base` must point at a writable mapping of at least `segment_len`
    /// bytes that nothing else references.
    unsafe fn format(&self, base: *mut u8, prefix: &[u8], segment_len: u64) {
        ptr::copy_nonoverlapping(prefix.as_ptr(), base, prefix.len());
        let header = &mut *(base.add(self.header_pos as usize) as *mut AllocatorHeader);
        header.init(self.first_block);
        let block = &mut *(base.add(self.first_block as usize) as *mut BlockHeader);
        block.init_free(segment_len - self.first_block - BLOCK_HEADER_SIZE);
    }
}

impl Manager {
    fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide manager all chain pointers resolve through.
    pub fn global() -> &'static Manager {
        &GLOBAL
    }

    fn next_chain_id(&self) -> ChainId {
        ChainId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ------------------------------------------------------------------
    // Chain lifecycle
    // ------------------------------------------------------------------

    /// Creates a chain in anonymous memory with the given prefix.
    pub fn create_chain(&self, prefix: &[u8]) -> Result<ChainId> {
        self.create_chain_sized(prefix, 0)
    }

    /// Creates an anonymous chain whose first segment is large enough for
    /// a root allocation of `root_bytes`, so the first allocation of that
    /// size is guaranteed to land at the canonical root position.
    pub fn create_chain_sized(&self, prefix: &[u8], root_bytes: u64) -> Result<ChainId> {
        let layout = ChainLayout::new(prefix.len())?;
        let segment_len = layout.initial_segment_len(root_bytes);
        let segment = Segment::anonymous(segment_len as usize)?;
        // SAFETY: the segment was just mapped with segment_len bytes and
        // is not yet registered, so nothing else can reach it.
        unsafe { layout.format(segment.base(), prefix, segment_len) };
        let id = self.register_chain(segment, segment_len, prefix.len() as u64, None);
        debug!(chain = %id, size = segment_len, "created anonymous chain");
        Ok(id)
    }

    /// Creates a chain over `file`, taking ownership of the handle.
    ///
    /// An empty file is extended to the base size, mapped, and formatted
    /// with the prefix and a fresh allocator. A non-empty file is mapped
    /// whole: its first bytes must equal `prefix` and its allocator
    /// structures are used as found, never reinitialized.
    pub fn open_chain(&self, file: File, prefix: &[u8]) -> Result<ChainId> {
        self.open_chain_sized(file, prefix, 0)
    }

    /// [`open_chain`](Self::open_chain) with a root capacity hint applied
    /// when the file turns out to be empty.
    pub fn open_chain_sized(&self, file: File, prefix: &[u8], root_bytes: u64) -> Result<ChainId> {
        let layout = ChainLayout::new(prefix.len())?;
        let file_len = file
            .metadata()
            .wrap_err("failed to stat backing file")?
            .len();

        if file_len == 0 {
            let segment_len = layout.initial_segment_len(root_bytes);
            file.set_len(segment_len)
                .wrap_err_with(|| format!("failed to extend backing file to {segment_len} bytes"))?;
            let segment = Segment::file_backed(&file, 0, segment_len as usize)?;
            // SAFETY: freshly mapped, correctly sized, unregistered.
            unsafe { layout.format(segment.base(), prefix, segment_len) };
            let id = self.register_chain(segment, segment_len, prefix.len() as u64, Some(file));
            debug!(chain = %id, size = segment_len, "created file-backed chain");
            return Ok(id);
        }

        ensure!(
            file_len >= layout.root_pos,
            "backing file of {} bytes is too small for an arena with a {} byte prefix",
            file_len,
            prefix.len()
        );
        let segment = Segment::file_backed(&file, 0, file_len as usize)?;
        // SAFETY: the mapping spans the whole file, which is at least
        // root_pos >= prefix.len() bytes long.
        let found = unsafe { slice::from_raw_parts(segment.base(), prefix.len()) };
        if found != prefix {
            return Err(ArenaError::PrefixMismatch {
                expected: prefix.to_vec(),
                found: found.to_vec(),
            }
            .into());
        }
        segment.prefetch();
        let id = self.register_chain(segment, file_len, prefix.len() as u64, Some(file));
        debug!(chain = %id, size = file_len, "mapped existing file as chain");
        Ok(id)
    }

    /// Copies `chain` into fresh anonymous memory and returns the copy.
    /// The source chain is unaffected. Not atomic against concurrent
    /// writers of the source.
    pub fn dissociate_chain(&self, chain: ChainId) -> Result<ChainId> {
        self.copy_chain(chain, None)
    }

    /// Copies `chain` onto `file` (extended to the chain's size) and
    /// returns the file-backed copy. The source chain is unaffected.
    pub fn associate_chain(&self, chain: ChainId, file: File) -> Result<ChainId> {
        self.copy_chain(chain, Some(file))
    }

    fn copy_chain(&self, chain: ChainId, file: Option<File>) -> Result<ChainId> {
        let (pieces, total_size, prefix_len) = {
            let registry = self.registry.read();
            let state = registry.chain(chain)?;
            let pieces: Vec<(u64, usize, u64)> = state
                .spans
                .iter()
                .map(|(&start, &span)| (start, span.base, span.len))
                .collect();
            (pieces, state.total_size, state.prefix_len)
        };

        let segment = match &file {
            Some(file) => {
                file.set_len(total_size)
                    .wrap_err_with(|| format!("failed to size backing file to {total_size} bytes"))?;
                Segment::file_backed(file, 0, total_size as usize)?
            }
            None => Segment::anonymous(total_size as usize)?,
        };
        for (start, base, len) in pieces {
            // SAFETY: source spans are live mappings of the recorded
            // lengths; the destination was just mapped with total_size
            // bytes, and spans tile [0, total_size) without overlap.
            unsafe {
                ptr::copy_nonoverlapping(
                    base as *const u8,
                    segment.base().add(start as usize),
                    len as usize,
                );
            }
        }
        if file.is_some() {
            segment.flush()?;
        }

        let id = self.register_chain(segment, total_size, prefix_len, file);
        debug!(source = %chain, copy = %id, bytes = total_size, "copied chain");
        Ok(id)
    }

    /// Unmaps all of `chain`'s segments, removes its index entries, and
    /// closes its backing file if it owns one. Pointers into the chain
    /// are invalid afterwards.
    pub fn destroy_chain(&self, chain: ChainId) -> Result<()> {
        let state = {
            let mut registry = self.registry.write();
            let state = registry
                .chains
                .remove(&chain)
                .ok_or(ArenaError::UnknownChain(chain))?;
            for span in state.spans.values() {
                registry.by_address.remove(&span.base);
            }
            state
        };
        if state.file.is_some() {
            for segment in &state.segments {
                segment.flush()?;
            }
        }
        debug!(chain = %chain, "destroyed chain");
        Ok(())
    }

    fn register_chain(
        &self,
        segment: Segment,
        len: u64,
        prefix_len: u64,
        file: Option<File>,
    ) -> ChainId {
        let id = self.next_chain_id();
        debug_assert_eq!(segment.len() as u64, len);
        let base = segment.base() as usize;
        let mut spans = BTreeMap::new();
        spans.insert(0, Span { base, len });

        let mut registry = self.registry.write();
        registry.by_address.insert(
            base,
            LinkRecord {
                chain: id,
                start: 0,
                len,
            },
        );
        registry.chains.insert(
            id,
            ChainState {
                spans,
                segments: smallvec![segment],
                total_size: len,
                prefix_len,
                file,
                alloc_lock: Arc::new(Mutex::new(())),
            },
        );
        id
    }

    /// Appends a segment able to hold a block of `block_bytes` to `chain`
    /// and returns its starting position and length. Existing segments are
    /// untouched. The caller must hold the chain's allocator mutex.
    pub(crate) fn grow_chain(&self, chain: ChainId, block_bytes: u64) -> Result<(u64, u64)> {
        let mut registry = self.registry.write();
        let Registry { chains, by_address } = &mut *registry;
        let state = chains
            .get_mut(&chain)
            .ok_or(ArenaError::UnknownChain(chain))?;

        let start = state.total_size;
        let len = align_up(state.total_size.max(block_bytes), BASE_SIZE);
        let segment = match &state.file {
            Some(file) => {
                file.set_len(start + len)
                    .wrap_err_with(|| format!("failed to extend backing file to {} bytes", start + len))?;
                match Segment::file_backed(file, start, len as usize) {
                    Ok(segment) => segment,
                    Err(err) => {
                        // Roll the file length back; the failed mapping was
                        // never registered.
                        let _ = file.set_len(start);
                        return Err(err);
                    }
                }
            }
            None => Segment::anonymous(len as usize)?,
        };

        let base = segment.base() as usize;
        state.spans.insert(start, Span { base, len });
        state.segments.push(segment);
        state.total_size += len;
        by_address.insert(
            base,
            LinkRecord { chain, start, len },
        );
        trace!(chain = %chain, start, len, "grew chain");
        Ok((start, len))
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// The chain containing `addr`, or [`ChainId::NONE`] if there is none.
    pub fn chain_of(&self, addr: *const u8) -> ChainId {
        let registry = self.registry.read();
        registry
            .record_at(addr as usize)
            .map(|(_, record)| record.chain)
            .unwrap_or(ChainId::NONE)
    }

    /// The chain and position of `addr`. With `len > 0`, the whole range
    /// `[addr, addr + len)` must lie inside one segment.
    pub fn chain_and_position(&self, addr: *const u8, len: u64) -> Result<(ChainId, u64)> {
        let registry = self.registry.read();
        let (base, record) = registry
            .record_at(addr as usize)
            .ok_or_else(|| ArenaError::OutOfChain(format!("address {addr:p}")))?;
        let offset = (addr as usize - base) as u64;
        if len > 0 && offset + len > record.len {
            return Err(ArenaError::CrossSegment {
                chain: record.chain,
                position: record.start + offset,
                len,
            }
            .into());
        }
        Ok((record.chain, record.start + offset))
    }

    /// The address of `position` within `chain`. With `len > 0`, the whole
    /// range must lie inside one segment.
    pub fn address_in_chain(&self, chain: ChainId, position: u64, len: u64) -> Result<*mut u8> {
        let registry = self.registry.read();
        registry.resolve(chain, position, len)
    }

    /// The address of `position` in the chain that contains `here`.
    pub fn address_in_same_chain(&self, here: *const u8, position: u64) -> Result<*mut u8> {
        let registry = self.registry.read();
        let (_, record) = registry
            .record_at(here as usize)
            .ok_or_else(|| ArenaError::OutOfChain(format!("address {here:p}")))?;
        registry.resolve(record.chain, position, 0)
    }

    /// The position of `target` in the chain that contains `here`. Fails
    /// with [`ArenaError::ChainMismatch`] when the two addresses resolve
    /// to different chains.
    pub fn position_in_same_chain(&self, here: *const u8, target: *const u8) -> Result<u64> {
        let registry = self.registry.read();
        let (_, here_record) = registry
            .record_at(here as usize)
            .ok_or_else(|| ArenaError::OutOfChain(format!("address {here:p}")))?;
        let (target_base, target_record) = registry
            .record_at(target as usize)
            .ok_or_else(|| ArenaError::OutOfChain(format!("address {target:p}")))?;
        if here_record.chain != target_record.chain {
            return Err(ArenaError::ChainMismatch {
                pointer_chain: here_record.chain,
                target_chain: target_record.chain,
            }
            .into());
        }
        Ok(target_record.start + (target as usize - target_base) as u64)
    }

    /// Whether `a` and `b` fall within the same segment of `chain`.
    pub(crate) fn same_segment(&self, chain: ChainId, a: u64, b: u64) -> Result<bool> {
        let registry = self.registry.read();
        let state = registry.chain(chain)?;
        let segment_start = |position: u64| {
            state
                .spans
                .range(..=position)
                .next_back()
                .map(|(&start, _)| start)
        };
        Ok(segment_start(a) == segment_start(b))
    }

    // ------------------------------------------------------------------
    // Allocation front door
    // ------------------------------------------------------------------

    /// Allocates `bytes` from `chain` and returns the user data address.
    /// Sizes are rounded up to the block granule; the chain grows by a new
    /// segment when no free block fits.
    pub fn allocate_from(&self, chain: ChainId, bytes: u64) -> Result<*mut u8> {
        let user_bytes = align_up(bytes.max(1), BLOCK_ALIGN);
        let (lock, prefix_len) = self.allocator_handle(chain)?;
        let _guard = lock.lock();
        let list = FreeList::new(self, chain, prefix_len);
        let position = list.acquire(user_bytes)?;
        self.address_in_chain(chain, position + BLOCK_HEADER_SIZE, user_bytes)
    }

    /// Allocates `bytes` from the chain that contains `here`.
    pub fn allocate_from_same_chain(&self, here: *const u8, bytes: u64) -> Result<*mut u8> {
        let (chain, _) = self.chain_and_position(here, 0)?;
        self.allocate_from(chain, bytes)
    }

    /// Returns the block whose user data starts at `addr` to the free list
    /// of its chain, coalescing with adjacent free neighbours.
    pub fn deallocate(&self, addr: *mut u8) -> Result<()> {
        let (chain, position) = self.chain_and_position(addr, 0)?;
        let (lock, prefix_len) = self.allocator_handle(chain)?;
        let layout = ChainLayout::for_prefix_len(prefix_len);
        ensure!(
            position >= layout.first_block + BLOCK_HEADER_SIZE,
            "address {:p} cannot be block user data",
            addr
        );
        let _guard = lock.lock();
        let list = FreeList::new(self, chain, prefix_len);
        list.release(position - BLOCK_HEADER_SIZE)
    }

    /// The address of the first allocation in `chain`, which is expected
    /// to be `bytes` long. Fails with [`ArenaError::RootShape`] when the
    /// chain is too small to contain such an allocation.
    pub fn first_allocation(&self, chain: ChainId, bytes: u64) -> Result<*mut u8> {
        let (root_pos, total_size) = {
            let registry = self.registry.read();
            let state = registry.chain(chain)?;
            let layout = ChainLayout::for_prefix_len(state.prefix_len);
            (layout.root_pos, state.total_size)
        };
        if total_size < root_pos + bytes {
            return Err(ArenaError::RootShape {
                chain,
                required: root_pos + bytes,
                actual: total_size,
            }
            .into());
        }
        self.address_in_chain(chain, root_pos, bytes)
    }

    fn allocator_handle(&self, chain: ChainId) -> Result<(Arc<Mutex<()>>, u64)> {
        let registry = self.registry.read();
        let state = registry.chain(chain)?;
        Ok((Arc::clone(&state.alloc_lock), state.prefix_len))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Total logical size of `chain` in bytes.
    pub fn chain_size(&self, chain: ChainId) -> Result<u64> {
        let registry = self.registry.read();
        Ok(registry.chain(chain)?.total_size)
    }

    /// The `(starting position, length)` of each segment of `chain`, in
    /// position order.
    pub fn segments(&self, chain: ChainId) -> Result<Vec<(u64, u64)>> {
        let registry = self.registry.read();
        let state = registry.chain(chain)?;
        Ok(state
            .spans
            .iter()
            .map(|(&start, &span)| (start, span.len))
            .collect())
    }

    /// The `(position, size)` of each free block of `chain`, in position
    /// order. Taken under the chain's allocator mutex.
    pub fn free_blocks(&self, chain: ChainId) -> Result<Vec<(u64, u64)>> {
        let (lock, prefix_len) = self.allocator_handle(chain)?;
        let _guard = lock.lock();
        FreeList::new(self, chain, prefix_len).blocks()
    }
}

impl Registry {
    fn record_at(&self, addr: usize) -> Option<(usize, LinkRecord)> {
        let (&base, &record) = self.by_address.range(..=addr).next_back()?;
        (addr - base < record.len as usize).then_some((base, record))
    }

    fn chain(&self, chain: ChainId) -> Result<&ChainState> {
        self.chains
            .get(&chain)
            .ok_or_else(|| ArenaError::UnknownChain(chain).into())
    }

    fn resolve(&self, chain: ChainId, position: u64, len: u64) -> Result<*mut u8> {
        let state = self.chain(chain)?;
        let out_of_chain =
            || ArenaError::OutOfChain(format!("position {position} in chain {chain}"));
        let (&start, &span) = state
            .spans
            .range(..=position)
            .next_back()
            .ok_or_else(out_of_chain)?;
        let offset = position - start;
        if offset >= span.len {
            return Err(out_of_chain().into());
        }
        if len > 0 && offset + len > span.len {
            return Err(ArenaError::CrossSegment {
                chain,
                position,
                len,
            }
            .into());
        }
        Ok((span.base + offset as usize) as *mut u8)
    }
}
