//! Relocation-safe pointers stored inside mapped memory.
//!
//! A [`ChainPtr`] is the only pointer form that may be stored inside a
//! chain. Its payload is a single big-endian chain position, with the
//! maximum value reserved for null, so its bytes mean the same thing no
//! matter where the chain is mapped. Resolution goes through the global
//! [`Manager`]: the pointer's own address identifies the chain, and the
//! stored position locates the target within that same chain.
//!
//! Because the payload is a position and not an offset from the pointer
//! itself, copying a pointer value to a different location *within the
//! same chain* preserves its target, including across segment boundaries.
//! Copying it into a different chain retargets it to whatever occupies
//! that position there; byte-for-byte chain copies rely on exactly this.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::ArenaError;

use super::endian::U64Be;
use super::manager::Manager;

pub(crate) const NULL_POSITION: u64 = u64::MAX;

/// Pointer to a `T` in the same chain as the pointer itself.
///
/// The pointer is valid only while it is stored inside a live chain;
/// a `ChainPtr` on the stack can hold null or be inspected, but assigning
/// a target or dereferencing requires the pointer's own address to resolve
/// to a chain.
#[repr(transparent)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChainPtr<T> {
    position: U64Be,
    _marker: PhantomData<T>,
}

impl<T> ChainPtr<T> {
    /// The null pointer; also the default value.
    pub const NULL: Self = Self {
        position: U64Be::from_bytes([0xff; 8]),
        _marker: PhantomData,
    };

    pub fn is_null(&self) -> bool {
        self.position.get() == NULL_POSITION
    }

    /// The stored target position, or `None` for null.
    pub fn position(&self) -> Option<u64> {
        let position = self.position.get();
        (position != NULL_POSITION).then_some(position)
    }

    pub(crate) fn set_position(&mut self, position: Option<u64>) {
        self.position.set(position.unwrap_or(NULL_POSITION));
    }

    /// Points this pointer at `target`, which must lie in the same chain
    /// as the pointer itself. A null `target` stores the null sentinel
    /// without consulting the manager.
    pub fn set(&mut self, target: *const T) -> Result<()> {
        if target.is_null() {
            self.set_position(None);
            return Ok(());
        }
        let position = Manager::global()
            .position_in_same_chain(self as *const Self as *const u8, target as *const u8)?;
        self.set_position(Some(position));
        Ok(())
    }

    /// Resolves the target address, or `None` when null.
    pub fn get(&self) -> Result<Option<NonNull<T>>> {
        match self.position() {
            None => Ok(None),
            Some(position) => {
                let addr = Manager::global()
                    .address_in_same_chain(self as *const Self as *const u8, position)?;
                Ok(NonNull::new(addr as *mut T))
            }
        }
    }

    /// Resolves the target address, surfacing [`ArenaError::NullDeref`]
    /// when the pointer is null.
    pub fn deref(&self) -> Result<NonNull<T>> {
        match self.get()? {
            Some(target) => Ok(target),
            None => Err(ArenaError::NullDeref.into()),
        }
    }

    /// Pointer arithmetic in units of `T`: the target address plus
    /// `items * size_of::<T>()` bytes. The caller is responsible for the
    /// result staying within one contiguous segment.
    pub fn offset(&self, items: usize) -> Result<NonNull<T>> {
        let base = self.deref()?;
        let addr = base.as_ptr() as usize + items * size_of::<T>();
        NonNull::new(addr as *mut T).ok_or_else(|| ArenaError::NullDeref.into())
    }
}

impl<T> Default for ChainPtr<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T> Clone for ChainPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ChainPtr<T> {}

impl<T> PartialEq for ChainPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.position.get() == other.position.get()
    }
}

impl<T> Eq for ChainPtr<T> {}

impl<T> fmt::Debug for ChainPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position() {
            Some(position) => write!(f, "ChainPtr({position})"),
            None => write!(f, "ChainPtr(null)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use super::*;

    #[test]
    fn null_is_all_ones_and_default() {
        let ptr = ChainPtr::<u64>::default();

        assert!(ptr.is_null());
        assert_eq!(ptr.position(), None);
        assert_eq!(ptr.as_bytes(), &[0xff; 8]);
    }

    #[test]
    fn cell_is_eight_bytes() {
        assert_eq!(size_of::<ChainPtr<u64>>(), 8);
        assert_eq!(size_of::<ChainPtr<[u8; 100]>>(), 8);
    }

    #[test]
    fn raw_position_round_trips() {
        let mut ptr = ChainPtr::<u8>::NULL;

        ptr.set_position(Some(40));

        assert_eq!(ptr.position(), Some(40));
        assert!(!ptr.is_null());

        ptr.set_position(None);

        assert!(ptr.is_null());
    }

    #[test]
    fn set_to_null_works_outside_any_chain() {
        let mut ptr = ChainPtr::<u8>::NULL;

        ptr.set(std::ptr::null()).unwrap();

        assert!(ptr.is_null());
    }

    #[test]
    fn set_outside_a_chain_is_rejected() {
        let mut ptr = ChainPtr::<u8>::NULL;
        let target = 7u8;

        let err = ptr.set(&target as *const u8).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ArenaError>(),
            Some(ArenaError::OutOfChain(_))
        ));
    }

    #[test]
    fn deref_of_null_surfaces_null_deref() {
        let ptr = ChainPtr::<u8>::NULL;

        let err = ptr.deref().unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ArenaError>(),
            Some(ArenaError::NullDeref)
        ));
    }
}
