//! Placement probing shared by backends.
//!
//! Reservation hints are advisory on most systems: if something already lives
//! at the requested address, `mmap` and friends are free to put the new
//! mapping anywhere else. A backend that has to honor a tolerance can't trust
//! the hint, so it asks for exact addresses one page at a time, walking away
//! from the hint in both directions:
//!
//! ```text
//!                        hint (rounded down)
//!                               |
//!   ... | -3 | -2 | -1 |  0  | +1 | +2 | +3 | ...
//!         5th  3rd  1st  0th  2nd  4th  6th
//! ```
//!
//! The walk stops as soon as the offset reaches the tolerance.

use crate::{align::align_down, Error, Result};

/// Finds a page range of `num_pages * granularity` bytes close to `hint`.
///
/// `reserve_at` receives an exact, page aligned address and a length in bytes
/// and must either reserve exactly that range and return its address, or
/// return `None` if the range is not available. Candidates are tried at
/// increasing multiples of `granularity` from the page containing `hint`,
/// below first and then above, while the offset is smaller than `tolerance`.
/// Addresses that would wrap around the address space are skipped.
///
/// # Errors
///
/// [`Error::Exhausted`] if every candidate within the tolerance was rejected.
///
/// # Panics
///
/// If `granularity` is zero.
pub fn search<F>(
    hint: usize,
    tolerance: usize,
    granularity: usize,
    num_pages: usize,
    mut reserve_at: F,
) -> Result<usize>
where
    F: FnMut(usize, usize) -> Option<usize>,
{
    assert!(granularity > 0, "page granularity must be non-zero");

    let Some(length) = num_pages.checked_mul(granularity) else {
        return Err(Error::Exhausted {
            hint,
            size: usize::MAX,
            tolerance,
        });
    };

    let base = align_down(hint, granularity);
    let mut offset = 0;

    while offset < tolerance {
        let below = base.checked_sub(offset);
        // Offset 0 is the same address in both directions.
        let above = (offset != 0).then(|| base.checked_add(offset)).flatten();

        if below.is_none() && above.is_none() {
            break;
        }

        for address in [below, above].into_iter().flatten() {
            if let Some(reserved) = reserve_at(address, length) {
                log::trace!("probe reserved {length:#x} bytes at {reserved:#x} for hint {hint:#x}");
                return Ok(reserved);
            }
        }

        offset = match offset.checked_add(granularity) {
            Some(next) => next,
            None => break,
        };
    }

    Err(Error::Exhausted {
        hint,
        size: length,
        tolerance,
    })
}
