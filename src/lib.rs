//! Sub-page allocator for executable memory.
//!
//! JIT compilers and binary patchers emit lots of tiny code stubs, and they
//! usually want them close to some address (the call site they patch) so that
//! relative branches can reach them. Reserving a full page per stub wastes
//! memory, and asking the OS for memory "near" an address doesn't guarantee
//! anything. [`BlockAllocator`] solves both problems: it reserves pages close
//! to a hint through a pluggable [`Backend`] and hands out [`Region`]s carved
//! from those pages, reusing free gaps whenever they are close enough.
//!
//! ```no_run
//! use execalloc::BlockAllocator;
//!
//! fn patched_function() {}
//!
//! let allocator = BlockAllocator::platform();
//! let hint = patched_function as usize;
//!
//! // 64 writable and executable bytes within 2 GiB of `hint`.
//! let mut stub = allocator.allocate(hint, 64).unwrap();
//! unsafe { stub.as_mut_slice()[0] = 0xC3 };
//!
//! // Seal it. This affects every region in the same mapping.
//! stub.set_writable(false);
//! ```
//!
//! The allocator is single threaded by design, see [`BlockAllocator`].

mod align;
mod allocator;
pub mod backend;
mod error;
mod mapping;
#[cfg(any(unix, windows))]
pub mod platform;
pub mod probe;
mod region;

pub use allocator::{BlockAllocator, Config, DEFAULT_TOLERANCE};
pub use backend::Backend;
pub use error::{Error, Result};
pub use mapping::Mapping;
#[cfg(any(unix, windows))]
pub use platform::PlatformBackend;
pub use region::Region;
