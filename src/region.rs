use std::{fmt, ops::Range, slice};

use crate::{backend::Backend, BlockAllocator, Error, Result};

/// Range of executable bytes handed out by a [`BlockAllocator`]. The region is
/// only a handle: it doesn't own any memory by itself, it just remembers where
/// it lives and tells its mapping when it's gone.
///
/// ```text
///                       mapping (owned by the allocator)
///  +-----------+---------------------------------+-----------------------+
///  |    ...    |         Region (from..to)       |          ...          |
///  +-----------+---------------------------------+-----------------------+
///              ^                                 ^
///            from                                to
/// ```
///
/// Protection is a property of the whole mapping. Changing it through one
/// region changes it for all the other regions that live in the same mapping,
/// so callers sharing a mapping must agree on it.
///
/// Dropping the region gives its bytes back. If it was the last region of its
/// mapping, the mapping is released to the backend as well.
pub struct Region<'a, B: Backend> {
    from: usize,
    to: usize,
    /// Mapping that contains this region. The start address identifies it
    /// within the allocator.
    mapping: Range<usize>,
    allocator: &'a BlockAllocator<B>,
}

impl<'a, B: Backend> Region<'a, B> {
    pub(crate) fn new(
        range: Range<usize>,
        mapping: Range<usize>,
        allocator: &'a BlockAllocator<B>,
    ) -> Self {
        Self {
            from: range.start,
            to: range.end,
            mapping,
            allocator,
        }
    }

    /// First address of the region.
    pub fn from(&self) -> usize {
        self.from
    }

    /// One past the last address of the region.
    pub fn to(&self) -> usize {
        self.to
    }

    /// Size in bytes, never zero.
    pub fn size(&self) -> usize {
        self.to - self.from
    }

    pub fn range(&self) -> Range<usize> {
        self.from..self.to
    }

    /// Bounds of the mapping that contains this region.
    pub fn mapping_range(&self) -> Range<usize> {
        self.mapping.clone()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.from as *mut u8
    }

    /// Whether the region, and therefore its whole mapping, is writable.
    pub fn is_writable(&self) -> bool {
        self.allocator.is_writable(self.mapping.start)
    }

    /// Changes protection of the entire mapping this region lives in. Every
    /// other region in the same mapping is affected too.
    pub fn set_writable(&self, writable: bool) {
        self.allocator.set_writable(self.mapping.start, writable);
    }

    /// Shrinks the region in place, keeping its start address. The bytes that
    /// are cut off can be handed out again.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidResize`] if `size` is larger than the current size and
    /// [`Error::ZeroSize`] if it's zero. The region is unchanged in both
    /// cases.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        if size > self.size() {
            return Err(Error::InvalidResize {
                current: self.size(),
                requested: size,
            });
        }

        if size == 0 {
            return Err(Error::ZeroSize);
        }

        self.to = self.from + size;
        self.allocator
            .shrink_region(self.mapping.start, self.from, self.to);

        Ok(())
    }

    /// Gives the region back. Same as dropping it.
    pub fn release(self) {}

    /// Region contents as a byte slice.
    ///
    /// # Safety
    ///
    /// The backend must map real memory at the region addresses (this is the
    /// case for [`crate::platform::PlatformBackend`]). Code executing from
    /// the region or writes through other pointers must not race with the
    /// returned slice.
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.as_ptr(), self.size())
    }

    /// Mutable region contents, used to write code into the region.
    ///
    /// # Safety
    ///
    /// Same as [`Self::as_slice`], and the region must be writable for as
    /// long as the slice is alive. Since protection is shared with the other
    /// regions of the mapping, none of them may seal it in the meantime.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.as_ptr(), self.size())
    }
}

impl<B: Backend> Drop for Region<'_, B> {
    fn drop(&mut self) {
        self.allocator.release_region(self.mapping.start, self.from);
    }
}

impl<B: Backend> fmt::Debug for Region<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("from", &format_args!("{:#x}", self.from))
            .field("to", &format_args!("{:#x}", self.to))
            .field("mapping", &format_args!("{:#x?}", self.mapping))
            .finish()
    }
}
