//! Owning handle for a chain and its root object.
//!
//! A [`MappedRoot<T>`] lives *outside* the mapped region and owns exactly
//! one chain, whose first allocation is a `T` called the root. The handle
//! is the bridge between normally allocated code and chain-resident data:
//! it creates the chain (`construct`), binds to a saved one (`load`),
//! copies it onto a file (`save`) or back into anonymous memory
//! (`dissociate`), and destroys it (`reset`, or drop).
//!
//! The root always sits at the canonical position directly after the
//! prefix, the allocator header, and one block header, because it is the
//! first allocation ever made in the chain. `get` finds it there again
//! after any number of save/load round trips.
//!
//! Root types must be plain mapped data: `#[repr(C)]`, zerocopy-readable
//! and writable, with [`ChainPtr`](super::ChainPtr) for any interior
//! pointers. The handle is move-only; moving it transfers the chain and
//! dropping it destroys the chain.

use std::fs::File;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;

use eyre::{ensure, Result, WrapErr};
use zerocopy::{FromBytes, IntoBytes};

use super::manager::{ChainId, Manager};

/// Unique owner of a chain whose root object is a `T`.
pub struct MappedRoot<T> {
    chain: ChainId,
    _marker: PhantomData<T>,
}

impl<T> Default for MappedRoot<T> {
    fn default() -> Self {
        Self {
            chain: ChainId::NONE,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for MappedRoot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRoot").field("chain", &self.chain).finish()
    }
}

impl<T: FromBytes + IntoBytes> MappedRoot<T> {
    /// An empty handle owning no chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh anonymous chain carrying `prefix`, allocates the
    /// root, and moves `root` into it.
    pub fn construct(prefix: &[u8], root: T) -> Result<Self> {
        let manager = Manager::global();
        let chain = manager.create_chain_sized(prefix, size_of::<T>() as u64)?;
        let addr = match manager.allocate_from(chain, size_of::<T>() as u64) {
            Ok(addr) => addr,
            Err(err) => {
                let _ = manager.destroy_chain(chain);
                return Err(err);
            }
        };
        // SAFETY: addr is the start of a fresh allocation of at least
        // size_of::<T>() bytes that nothing else references yet.
        unsafe { ptr::write(addr as *mut T, root) };
        Ok(Self {
            chain,
            _marker: PhantomData,
        })
    }

    /// Binds to the chain saved in `file` by a previous `save`, taking
    /// ownership of the handle. The root is already present in the file
    /// and is not reinitialized.
    pub fn load(file: File, prefix: &[u8]) -> Result<Self> {
        let chain = Manager::global().open_chain_sized(file, prefix, size_of::<T>() as u64)?;
        Ok(Self {
            chain,
            _marker: PhantomData,
        })
    }

    /// Loads the root from `file` when it is non-empty, or creates a
    /// file-backed chain there and installs `init` as the root when it is
    /// empty.
    pub fn open(file: File, prefix: &[u8], init: T) -> Result<Self> {
        let file_len = file
            .metadata()
            .wrap_err("failed to stat backing file")?
            .len();
        if file_len > 0 {
            return Self::load(file, prefix);
        }

        let manager = Manager::global();
        let chain = manager.open_chain_sized(file, prefix, size_of::<T>() as u64)?;
        let addr = match manager.allocate_from(chain, size_of::<T>() as u64) {
            Ok(addr) => addr,
            Err(err) => {
                let _ = manager.destroy_chain(chain);
                return Err(err);
            }
        };
        // SAFETY: as in construct; the allocation is fresh and unshared.
        unsafe { ptr::write(addr as *mut T, init) };
        Ok(Self {
            chain,
            _marker: PhantomData,
        })
    }

    /// Copies the chain onto `file` and adopts the file-backed copy,
    /// destroying the previously owned chain.
    pub fn save(&mut self, file: File) -> Result<()> {
        ensure!(!self.chain.is_none(), "cannot save an empty handle");
        let manager = Manager::global();
        let replacement = manager.associate_chain(self.chain, file)?;
        manager.destroy_chain(self.chain)?;
        self.chain = replacement;
        Ok(())
    }

    /// Copies the chain into anonymous memory and adopts the copy,
    /// destroying the previously owned chain. Afterwards no modification
    /// reaches any backing file.
    pub fn dissociate(&mut self) -> Result<()> {
        ensure!(!self.chain.is_none(), "cannot dissociate an empty handle");
        let manager = Manager::global();
        let replacement = manager.dissociate_chain(self.chain)?;
        manager.destroy_chain(self.chain)?;
        self.chain = replacement;
        Ok(())
    }

    /// Destroys the owned chain, if any, and becomes empty.
    pub fn reset(&mut self) -> Result<()> {
        if !self.chain.is_none() {
            Manager::global().destroy_chain(self.chain)?;
            self.chain = ChainId::NONE;
        }
        Ok(())
    }

    /// The root object.
    pub fn get(&self) -> Result<&T> {
        ensure!(!self.chain.is_none(), "handle is empty");
        let addr = Manager::global().first_allocation(self.chain, size_of::<T>() as u64)?;
        // SAFETY: first_allocation verified the chain holds size_of::<T>()
        // bytes at the root position; T is FromBytes, so any bit pattern
        // there is a valid T. The shared borrow of self brackets the
        // lifetime, and segments never move while the chain lives.
        Ok(unsafe { &*(addr as *const T) })
    }

    /// The root object, mutably.
    pub fn get_mut(&mut self) -> Result<&mut T> {
        ensure!(!self.chain.is_none(), "handle is empty");
        let addr = Manager::global().first_allocation(self.chain, size_of::<T>() as u64)?;
        // SAFETY: as in get; the exclusive borrow of the unique owner
        // rules out other references through this handle.
        Ok(unsafe { &mut *(addr as *mut T) })
    }

    /// Whether the handle owns no chain.
    pub fn is_empty(&self) -> bool {
        self.chain.is_none()
    }

    /// The owned chain, for direct manager calls like
    /// [`Manager::allocate_from`]. [`ChainId::NONE`] when empty.
    pub fn chain_id(&self) -> ChainId {
        self.chain
    }
}

impl<T> Drop for MappedRoot<T> {
    fn drop(&mut self) {
        if !self.chain.is_none() {
            let _ = Manager::global().destroy_chain(self.chain);
        }
    }
}
