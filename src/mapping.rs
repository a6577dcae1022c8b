use std::{collections::BTreeMap, ops::Range};

use crate::{align::distance, backend::Backend};

/// Contiguous, page aligned reservation obtained from a [`Backend`]. Mappings
/// are carved into regions, and since protection can only be changed for
/// whole pages, writability is tracked here and not per region:
///
/// ```text
/// from                                                                to
///  +-----------+--------+-------------+------------------+-------------+
///  |  Region   |  Free  |   Region    |       Free       |   Region    |
///  +-----------+--------+-------------+------------------+-------------+
///  <------------------------ writable: bool --------------------------->
/// ```
///
/// Live regions are stored by address, the start of each region is the key and
/// the end is the value. Regions never overlap and are never empty, so the
/// start address identifies a region within its mapping.
#[derive(Debug)]
pub struct Mapping {
    from: usize,
    to: usize,
    used_regions: BTreeMap<usize, usize>,
    writable: bool,
}

impl Mapping {
    pub(crate) fn new(from: usize, to: usize, writable: bool) -> Self {
        debug_assert!(from < to);
        Self {
            from,
            to,
            used_regions: BTreeMap::new(),
            writable,
        }
    }

    /// First address of the mapping.
    pub fn from(&self) -> usize {
        self.from
    }

    /// One past the last address of the mapping.
    pub fn to(&self) -> usize {
        self.to
    }

    /// Size in bytes, always a multiple of the allocator granularity.
    pub fn size(&self) -> usize {
        self.to - self.from
    }

    /// Mappings owned by an allocator are released as soon as this becomes
    /// true.
    pub(crate) fn is_empty(&self) -> bool {
        self.used_regions.is_empty()
    }

    /// Current protection of the whole mapping.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Live regions in address order.
    pub fn regions(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.used_regions.iter().map(|(&from, &to)| from..to)
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.used_regions.len()
    }

    /// Scans the gaps from low to high addresses and returns the start of the
    /// first one that can hold `size` bytes.
    fn find_gap(&self, size: usize) -> Option<usize> {
        let mut cursor = self.from;

        for (&from, &to) in &self.used_regions {
            if from - cursor >= size {
                return Some(cursor);
            }
            cursor = to;
        }

        (self.to - cursor >= size).then_some(cursor)
    }

    /// Same as [`Self::find_gap`] but scanning from high to low addresses. The
    /// returned location is placed at the end of the gap, so that the region
    /// stays as high as possible.
    fn find_gap_reverse(&self, size: usize) -> Option<usize> {
        let mut cursor = self.to;

        for (&from, &to) in self.used_regions.iter().rev() {
            if cursor - to >= size {
                return Some(cursor - size);
            }
            cursor = from;
        }

        (cursor - self.from >= size).then_some(cursor - size)
    }

    /// Looks for a location where `size` bytes fit without any byte being
    /// farther than `tolerance` from `hint`. Returns the location and its
    /// distance to `hint`.
    ///
    /// The whole mapping is rejected upfront when any of its edges is out of
    /// tolerance, even if some gap close to the other edge would qualify.
    /// Otherwise the forward scan is tried before the reverse scan and the
    /// first candidate that qualifies is returned, the two are not compared.
    pub(crate) fn find_region_in_tolerance(
        &self,
        hint: usize,
        size: usize,
        tolerance: usize,
    ) -> Option<(usize, usize)> {
        if distance(self.from, hint) > tolerance || distance(self.to, hint) > tolerance {
            return None;
        }

        [self.find_gap(size), self.find_gap_reverse(size)]
            .into_iter()
            .flatten()
            .find(|&location| {
                distance(location, hint) <= tolerance
                    && distance(location + size, hint) <= tolerance
            })
            .map(|location| (location, distance(location, hint)))
    }

    /// Marks `[location, location + size)` as used. The placement search
    /// never computes out of bounds locations, so if this fails something is
    /// seriously broken and we can't continue.
    pub(crate) fn acquire_region(&mut self, location: usize, size: usize) -> Range<usize> {
        assert!(
            location >= self.from && location + size <= self.to,
            "region {location:#x}+{size:#x} out of mapping {:#x}..{:#x}",
            self.from,
            self.to,
        );

        let previous = self.used_regions.insert(location, location + size);
        debug_assert!(previous.is_none(), "region {location:#x} acquired twice");

        location..location + size
    }

    /// Moves the end of the region starting at `from` down to `to`.
    pub(crate) fn shrink_region(&mut self, from: usize, to: usize) {
        if let Some(end) = self.used_regions.get_mut(&from) {
            debug_assert!(from < to && to <= *end);
            *end = to;
        }
    }

    /// Forgets the region starting at `from`. Returns `true` if the mapping
    /// is now empty and should be released.
    pub(crate) fn remove_region(&mut self, from: usize) -> bool {
        self.used_regions.remove(&from);
        self.is_empty()
    }

    /// Changes protection of the entire mapping, which affects every region
    /// carved from it. Doesn't call the backend if nothing changes.
    pub(crate) fn set_writable<B: Backend>(&mut self, writable: bool, backend: &mut B) {
        if self.writable == writable {
            return;
        }

        log::debug!(
            "mapping {:#x}..{:#x} writable: {} -> {writable}",
            self.from,
            self.to,
            self.writable,
        );

        backend.change_protection(self.from, self.size(), writable);
        self.writable = writable;
    }
}
