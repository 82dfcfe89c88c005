//! Per-type allocator façade for objects living inside a chain.
//!
//! A [`ChainAllocator`] is embedded in a mapped object and allocates from
//! the chain containing itself. Its only state is its own address: at call
//! time the manager resolves which chain the façade lives in, so every
//! façade embedded anywhere in a chain, under any element type, denotes
//! that chain's one allocator. It occupies a single byte so that it has a
//! real position inside the chain.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::manager::Manager;

/// Allocator handle stored inside mapped memory, generic over the element
/// type it hands out.
#[repr(transparent)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChainAllocator<T> {
    _anchor: u8,
    _marker: PhantomData<T>,
}

impl<T> ChainAllocator<T> {
    /// Allocates room for `items` values of `T` from the chain containing
    /// this façade and returns the address of the first.
    pub fn allocate(&self, items: usize) -> Result<NonNull<T>> {
        let bytes = (items * size_of::<T>()) as u64;
        let addr = Manager::global()
            .allocate_from_same_chain(self as *const Self as *const u8, bytes)?;
        // SAFETY: a successful allocation never returns a null address.
        Ok(unsafe { NonNull::new_unchecked(addr as *mut T) })
    }

    /// Returns a previous allocation to the chain. The item count is
    /// carried for symmetry with `allocate`; the block size is recorded in
    /// the block header.
    pub fn deallocate(&self, ptr: NonNull<T>, _items: usize) -> Result<()> {
        Manager::global().deallocate(ptr.as_ptr() as *mut u8)
    }

    /// A façade value for another element type. All façades in one chain
    /// refer to the same allocator, so this carries no state.
    pub fn rebind<U>(&self) -> ChainAllocator<U> {
        ChainAllocator::default()
    }
}

impl<T> Default for ChainAllocator<T> {
    fn default() -> Self {
        Self {
            _anchor: 0,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for ChainAllocator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ChainAllocator<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_is_one_byte() {
        assert_eq!(size_of::<ChainAllocator<u64>>(), 1);
        assert_eq!(size_of::<ChainAllocator<[u8; 4096]>>(), 1);
    }

    #[test]
    fn facade_outside_a_chain_cannot_allocate() {
        let facade = ChainAllocator::<u64>::default();

        assert!(facade.allocate(1).is_err());
    }
}
