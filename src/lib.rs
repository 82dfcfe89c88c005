//! # mmarena - Mapped Memory Arenas with Stable Internal Pointers
//!
//! mmarena is a file-backed memory-mapped arena allocator. It lets linked
//! data structures (lists, trees, index nodes) live inside a region of
//! memory that can be saved to and loaded from disk with zero serialization
//! work, because the pointers stored *inside* the region survive being
//! mapped at a different virtual address.
//!
//! ## Core Idea
//!
//! Memory is organized into **chains**: logically contiguous byte sequences
//! realized as one or more mapped **segments**. A segment, once mapped, is
//! never moved, resized, or unmapped while its chain is alive; growing a
//! chain appends a new segment at a fresh virtual address. Pointers stored
//! inside a chain ([`ChainPtr`]) hold a *chain position* rather than a raw
//! address, and resolve through the process-wide [`Manager`], so they remain
//! valid across:
//!
//! - remapping the chain at a different base address (load from file)
//! - growth of the chain into additional non-contiguous segments
//! - byte-for-byte copies of the whole chain into another chain
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  MappedRoot<T>  (owning handle)      │  construct/load/save/dissociate
//! ├──────────────────────────────────────┤
//! │  ChainAllocator<T> │ ChainPtr<T>     │  in-chain allocator façade and
//! ├──────────────────────────────────────┤  relocation-safe pointers
//! │  Manager (segment indexes, locks)    │  chain lifecycle + resolution
//! ├──────────────────────────────────────┤
//! │  free-list allocator (in the chain)  │  first-fit, split, coalesce
//! ├──────────────────────────────────────┤
//! │  mmap segments (anonymous / file)    │  memmap2, never relocated
//! └──────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Format
//!
//! A file-backed chain *is* its file: file offset equals chain position,
//! with no framing, checksums, or version headers. The layout is an opaque
//! user prefix (at most 16 bytes), the allocator header (two big-endian
//! free-list positions), and then a sequence of blocks, each a 24-byte
//! header followed by user data. All multi-byte integers on disk are
//! big-endian, so files written on one host are usable on another.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mmarena::{ChainPtr, MappedRoot, U64Be};
//! use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};
//!
//! #[repr(C)]
//! #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
//! struct Counter {
//!     value: U64Be,
//!     next: ChainPtr<Counter>,
//! }
//!
//! let mut root = MappedRoot::<Counter>::construct(b"CTR1", Counter::new_zeroed())?;
//! root.get_mut()?.value.set(42);
//!
//! let file = std::fs::OpenOptions::new()
//!     .read(true).write(true).create(true).open("counter.arena")?;
//! root.save(file)?;
//! ```
//!
//! ## Concurrency
//!
//! The segment indexes are guarded by a single readers-writer lock: pointer
//! resolution takes a shared guard, chain lifecycle changes take an
//! exclusive one. Each chain additionally carries a mutex serializing
//! allocate and deallocate. The manager guarantees mapping stability, not
//! object-level safety; concurrent mutation of one object still needs the
//! caller's own synchronization.
//!
//! ## Module Overview
//!
//! - [`arena`]: chains, segments, the manager, pointers, allocator, handle
//! - [`error`]: the typed error taxonomy surfaced through `eyre::Result`

pub mod arena;
pub mod error;

pub use arena::{
    ChainAllocator, ChainId, ChainPtr, MappedRoot, Manager, I16Be, I32Be, I64Be, U16Be, U32Be,
    U64Be, ALLOCATOR_HEADER_SIZE, BASE_SIZE, BLOCK_ALIGN, BLOCK_HEADER_SIZE, MAX_PREFIX_SIZE,
};
pub use error::ArenaError;
