use thiserror::Error;

/// Everything that can go wrong when asking for executable memory.
///
/// Errors are always reported to the caller that triggered them and the
/// allocator state is left exactly as it was before the call. There are two
/// families, see [`Error::is_invalid_request`] and
/// [`Error::is_allocation_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Zero sized regions can't be told apart from each other because live
    /// regions are keyed by their start address.
    #[error("zero sized regions are not supported")]
    ZeroSize,

    /// Regions can only shrink in place, the bytes after the current end
    /// might already belong to somebody else.
    #[error(
        "cannot resize a region of {current} bytes to {requested} bytes, regions can only shrink"
    )]
    InvalidResize { current: usize, requested: usize },

    /// The backend could not reserve pages anywhere within `tolerance` bytes
    /// of `hint`.
    #[error("no placement for {size} bytes within {tolerance} bytes of {hint:#x}")]
    Exhausted {
        hint: usize,
        size: usize,
        tolerance: usize,
    },

    /// The backend reserved pages at `address`, but the region wouldn't fit
    /// within `tolerance` bytes of `hint` there. The pages have already been
    /// given back.
    #[error(
        "backend placed a mapping at {address:#x}, outside of {tolerance} bytes around {hint:#x}"
    )]
    Misplaced {
        address: usize,
        hint: usize,
        tolerance: usize,
    },

    /// The backend handed out pages that already belong to a live mapping.
    /// Nothing is released, the pages are still in use.
    #[error("backend reserved {address:#x}..{end:#x}, which overlaps a live mapping")]
    Overlapping { address: usize, end: usize },
}

impl Error {
    /// The request itself makes no sense, retrying it won't help.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::ZeroSize | Self::InvalidResize { .. })
    }

    /// The request was fine but no memory could be found for it.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. } | Self::Misplaced { .. } | Self::Overlapping { .. }
        )
    }
}

/// Shorter syntax for fallible operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;
