#![allow(dead_code)]

use std::{collections::BTreeMap, ops::Range};

use execalloc::{probe, Backend, Result};

pub const PAGE: usize = 0x1000;

/// Something the allocator asked the backend to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Reserve { address: usize, length: usize, writable: bool },
    Release { address: usize, length: usize },
    Protect { address: usize, length: usize, writable: bool },
}

/// In-memory address space. Reservations never touch real memory, they are
/// only recorded so tests can check what the allocator asked for.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    /// Reserved ranges, start to end.
    reserved: BTreeMap<usize, usize>,
    /// Ranges that can't be reserved, as if something else lived there.
    taken: Vec<Range<usize>>,
    /// Refuses every reservation when set.
    pub unavailable: bool,
    pub calls: Vec<Call>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Marks `range` as used by someone else.
    pub fn with_taken(mut self, range: Range<usize>) -> Self {
        self.taken.push(range);
        self
    }

    pub fn reserved(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.reserved.iter().map(|(&from, &to)| from..to)
    }

    pub fn releases(&self) -> Vec<(usize, usize)> {
        self.calls
            .iter()
            .filter_map(|call| match *call {
                Call::Release { address, length } => Some((address, length)),
                _ => None,
            })
            .collect()
    }

    pub fn protections(&self) -> Vec<(usize, usize, bool)> {
        self.calls
            .iter()
            .filter_map(|call| match *call {
                Call::Protect {
                    address,
                    length,
                    writable,
                } => Some((address, length, writable)),
                _ => None,
            })
            .collect()
    }

    fn is_free(&self, range: &Range<usize>) -> bool {
        let overlaps = |from: usize, to: usize| from < range.end && range.start < to;

        !self.reserved.iter().any(|(&from, &to)| overlaps(from, to))
            && !self.taken.iter().any(|taken| overlaps(taken.start, taken.end))
    }
}

impl Backend for SimulatedBackend {
    fn reserve_near(
        &mut self,
        hint: usize,
        tolerance: usize,
        num_pages: usize,
        writable: bool,
    ) -> Result<usize> {
        if self.unavailable {
            return probe::search(hint, tolerance, PAGE, num_pages, |_, _| None);
        }

        let address = probe::search(hint, tolerance, PAGE, num_pages, |address, length| {
            let end = address.checked_add(length)?;
            self.is_free(&(address..end)).then_some(address)
        })?;

        let length = num_pages * PAGE;
        self.reserved.insert(address, address + length);
        self.calls.push(Call::Reserve {
            address,
            length,
            writable,
        });

        Ok(address)
    }

    fn release(&mut self, address: usize, length: usize) {
        assert_eq!(
            self.reserved.remove(&address),
            Some(address + length),
            "released a range that was never reserved"
        );
        self.calls.push(Call::Release { address, length });
    }

    fn change_protection(&mut self, address: usize, length: usize, writable: bool) {
        assert_eq!(self.reserved.get(&address), Some(&(address + length)));
        self.calls.push(Call::Protect {
            address,
            length,
            writable,
        });
    }
}

/// Number of live regions in each mapping, in creation order.
pub fn layout<B: Backend>(allocator: &execalloc::BlockAllocator<B>) -> Vec<usize> {
    allocator.with_mappings(|mappings| {
        mappings
            .iter()
            .map(|mapping| mapping.region_count())
            .collect()
    })
}
