use std::fmt;

use crate::{probe, Result};

/// Page level memory operations that a [`crate::BlockAllocator`] builds on.
/// The allocator doesn't care whether pages come from the kernel, from a page
/// table we manage ourselves or from another process, it only needs these
/// three capabilities. All of them work in units of the granularity the
/// allocator was built with.
///
/// Implementations must never call back into the allocator that owns them.
pub trait Backend {
    /// Reserves `num_pages` pages that are readable, executable and, if
    /// `writable` is set, writable. The whole range should lie within
    /// `tolerance` bytes of `hint`. The allocator verifies the returned
    /// address and gives the pages back if the contract was not honored.
    ///
    /// See [`crate::probe::search`] for the usual way of implementing this.
    fn reserve_near(
        &mut self,
        hint: usize,
        tolerance: usize,
        num_pages: usize,
        writable: bool,
    ) -> Result<usize>;

    /// Releases a range previously returned by [`Backend::reserve_near`].
    /// Failures can't be handled by the allocator, so they are up to the
    /// implementation.
    fn release(&mut self, address: usize, length: usize);

    /// Adds or removes write access on an already reserved range, keeping it
    /// readable and executable.
    fn change_protection(&mut self, address: usize, length: usize, writable: bool);
}

/// [`Backend`] made of three closures, for callers that would rather inject
/// capabilities than implement a trait.
///
/// ```
/// use execalloc::{backend::FnBackend, probe, BlockAllocator};
///
/// let backend = FnBackend::new(
///     |hint, tolerance, num_pages, _writable| {
///         probe::search(hint, tolerance, 4096, num_pages, |_, _| None)
///     },
///     |_address, _length| {},
///     |_address, _length, _writable| {},
/// );
///
/// let allocator = BlockAllocator::new(backend, 4096);
/// assert!(allocator.allocate(0x7000_0000, 64).unwrap_err().is_allocation_failure());
/// ```
pub struct FnBackend<R, D, P> {
    reserve: R,
    release: D,
    protect: P,
}

impl<R, D, P> FnBackend<R, D, P>
where
    R: FnMut(usize, usize, usize, bool) -> Result<usize>,
    D: FnMut(usize, usize),
    P: FnMut(usize, usize, bool),
{
    pub fn new(reserve: R, release: D, protect: P) -> Self {
        Self {
            reserve,
            release,
            protect,
        }
    }
}

impl<R, D, P> Backend for FnBackend<R, D, P>
where
    R: FnMut(usize, usize, usize, bool) -> Result<usize>,
    D: FnMut(usize, usize),
    P: FnMut(usize, usize, bool),
{
    fn reserve_near(
        &mut self,
        hint: usize,
        tolerance: usize,
        num_pages: usize,
        writable: bool,
    ) -> Result<usize> {
        (self.reserve)(hint, tolerance, num_pages, writable)
    }

    fn release(&mut self, address: usize, length: usize) {
        (self.release)(address, length)
    }

    fn change_protection(&mut self, address: usize, length: usize, writable: bool) {
        (self.protect)(address, length, writable)
    }
}

impl<R, D, P> fmt::Debug for FnBackend<R, D, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBackend").finish_non_exhaustive()
    }
}

/// Page protection requested from a [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    /// What executable mappings need: always readable and executable, write
    /// access only on demand.
    pub const fn executable(writable: bool) -> Self {
        Self {
            read: true,
            write: writable,
            execute: true,
        }
    }
}

/// Memory manager that places pages at exact addresses, for environments that
/// manage their own page tables or allocate inside another process.
pub trait MemoryManager {
    type Error: fmt::Display;

    /// Smallest unit `allocate`, `deallocate` and `protect` work with.
    fn page_granularity(&self) -> usize;

    /// Allocates `length` bytes at exactly `address`.
    fn allocate(
        &self,
        address: usize,
        length: usize,
        protection: Protection,
    ) -> std::result::Result<usize, Self::Error>;

    fn deallocate(&self, address: usize, length: usize);

    fn protect(&self, address: usize, length: usize, protection: Protection);
}

/// [`Backend`] that forwards to a [`MemoryManager`], probing for free
/// addresses around the hint with [`probe::search`].
#[derive(Debug)]
pub struct ManagedBackend<M> {
    manager: M,
}

impl<M: MemoryManager> ManagedBackend<M> {
    pub fn new(manager: M) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Granularity the allocator should be built with.
    pub fn granularity(&self) -> usize {
        self.manager.page_granularity()
    }
}

impl<M: MemoryManager> Backend for ManagedBackend<M> {
    fn reserve_near(
        &mut self,
        hint: usize,
        tolerance: usize,
        num_pages: usize,
        writable: bool,
    ) -> Result<usize> {
        let protection = Protection::executable(writable);
        let manager = &self.manager;

        probe::search(hint, tolerance, manager.page_granularity(), num_pages, |address, length| {
            match manager.allocate(address, length, protection) {
                Ok(address) => Some(address),
                Err(err) => {
                    log::trace!("memory manager refused {length:#x} bytes at {address:#x}: {err}");
                    None
                }
            }
        })
    }

    fn release(&mut self, address: usize, length: usize) {
        self.manager.deallocate(address, length);
    }

    fn change_protection(&mut self, address: usize, length: usize, writable: bool) {
        self.manager
            .protect(address, length, Protection::executable(writable));
    }
}
