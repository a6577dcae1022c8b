/// Rounds `address` down to the closest multiple of `granularity`. The
/// granularity doesn't need to be a power of two, backends are free to report
/// any page size they want.
#[inline]
pub(crate) fn align_down(address: usize, granularity: usize) -> usize {
    address - address % granularity
}

/// Number of pages of `granularity` bytes needed to hold `size` bytes. Forces
/// round up, so 1.5 pages worth of bytes become 2 pages.
#[inline]
pub(crate) fn pages_for(size: usize, granularity: usize) -> usize {
    size / granularity + usize::from(size % granularity != 0)
}

/// Absolute distance between two addresses. Hints can be above or below any
/// candidate location so we can't just subtract.
#[inline]
pub(crate) fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}
