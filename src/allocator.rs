use std::{cell::RefCell, fmt};

use crate::{
    align::pages_for, backend::Backend, mapping::Mapping, region::Region, Error, Result,
};

/// Tolerance used when the caller doesn't specify one: anything reachable with
/// a signed 32 bit displacement, which is what relative calls and jumps can
/// encode on most architectures.
pub const DEFAULT_TOLERANCE: usize = i32::MAX as usize;

/// Defaults applied by [`BlockAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum distance between the hint and any byte of the region.
    pub default_tolerance: usize,
    /// Whether regions have to be writable. When `false`, writable memory
    /// may still be returned if the region lands in a writable mapping.
    pub default_writable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_tolerance: DEFAULT_TOLERANCE,
            default_writable: true,
        }
    }
}

/// Mutable part of the allocator. Regions only hold shared references to the
/// allocator, so everything they can modify lives here.
struct State<B> {
    /// Mappings in creation order. The order matters because the first
    /// mapping found wins when two of them are equally close to the hint.
    mappings: Vec<Mapping>,
    /// Provider of pages.
    backend: B,
}

impl<B> State<B> {
    fn position(&self, mapping: usize) -> Option<usize> {
        self.mappings.iter().position(|m| m.from() == mapping)
    }
}

/// This is where the circle gets completed. The allocator owns every
/// [`Mapping`] it has obtained from its [`Backend`], and each mapping is
/// carved into [`Region`] handles owned by the callers:
///
/// ```text
///                 +---------------------------------------------+
///                 |               BlockAllocator                |
///                 +---------------------------------------------+
///                     |                      |               |
///                     v                      v               v
///           +------------------+   +-----------------+   +-------+
///           |     Mapping      |   |     Mapping     |   |  ...  |
///           | RX, 2 pages      |   | RWX, 1 page     |   |       |
///           +------------------+   +-----------------+   +-------+
///             ^          ^              ^
///             |          |              |
///          Region      Region         Region  <- Dropping the last one
///                                                releases the mapping.
/// ```
///
/// Requests are served from the existing mapping with a gap closest to the
/// hint. Only when no mapping has a gap within tolerance, new pages are
/// reserved from the backend.
///
/// This struct is not thread safe. Every operation, including dropping a
/// [`Region`], mutates shared state, so concurrent access must be serialized
/// by wrapping the allocator and all its regions behind a single lock. Since
/// regions borrow the allocator, it can't be dropped or moved while memory is
/// still handed out.
pub struct BlockAllocator<B: Backend> {
    state: RefCell<State<B>>,
    /// Page size of the backend. Mappings are always a multiple of this.
    granularity: usize,
    config: Config,
}

impl<B: Backend> BlockAllocator<B> {
    /// Builds an allocator on top of `backend`, which works with pages of
    /// `granularity` bytes. No memory is reserved until the first request.
    ///
    /// # Panics
    ///
    /// If `granularity` is zero.
    pub fn new(backend: B, granularity: usize) -> Self {
        Self::with_config(backend, granularity, Config::default())
    }

    /// Same as [`Self::new`] with custom defaults for [`Self::allocate`].
    pub fn with_config(backend: B, granularity: usize, config: Config) -> Self {
        assert!(granularity > 0, "page granularity must be non-zero");

        Self {
            state: RefCell::new(State {
                mappings: Vec::new(),
                backend,
            }),
            granularity,
            config,
        }
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Calls `f` with the current mappings in creation order.
    ///
    /// `f` must not call into the allocator or drop regions, doing so panics.
    pub fn with_mappings<R>(&self, f: impl FnOnce(&[Mapping]) -> R) -> R {
        f(&self.state.borrow().mappings)
    }

    pub fn mapping_count(&self) -> usize {
        self.state.borrow().mappings.len()
    }

    /// Calls `f` with the backend. Same restrictions as
    /// [`Self::with_mappings`].
    pub fn with_backend<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.state.borrow().backend)
    }

    /// Allocates `size` bytes near `hint` using the configured defaults. See
    /// [`Self::get_region`].
    pub fn allocate(&self, hint: usize, size: usize) -> Result<Region<'_, B>> {
        self.get_region(
            hint,
            size,
            self.config.default_writable,
            self.config.default_tolerance,
        )
    }

    /// Returns a region of exactly `size` executable bytes such that both its
    /// start and its end are at most `tolerance` bytes away from `hint`.
    ///
    /// If `needs_writable` is set and the region lands in a mapping that is
    /// not writable, the entire mapping becomes writable, including any other
    /// region that lives in it. If it's not set, the region may still be
    /// writable, call [`Region::set_writable`] to seal it.
    ///
    /// # Errors
    ///
    /// - [`Error::ZeroSize`] if `size` is zero.
    /// - [`Error::Exhausted`] if no existing mapping has room and the backend
    ///   can't reserve pages within tolerance.
    /// - [`Error::Misplaced`] if the backend reserved pages too far away.
    /// - [`Error::Overlapping`] if the backend reserved pages that belong to
    ///   an existing mapping.
    ///
    /// The allocator is left untouched when an error is returned.
    pub fn get_region(
        &self,
        hint: usize,
        size: usize,
        needs_writable: bool,
        tolerance: usize,
    ) -> Result<Region<'_, B>> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }

        let mut state = self.state.borrow_mut();
        let State { mappings, backend } = &mut *state;

        if let Some((index, location)) = Self::find_closest(mappings, hint, size, tolerance) {
            let mapping = &mut mappings[index];

            // Escalation only, requests never downgrade a mapping.
            if needs_writable && !mapping.is_writable() {
                mapping.set_writable(true, backend);
            }

            let range = mapping.acquire_region(location, size);
            log::trace!("reused mapping {:#x} for {range:#x?}", mapping.from());

            return Ok(Region::new(range, mapping.from()..mapping.to(), self));
        }

        let mut mapping = self.reserve_mapping(backend, hint, size, needs_writable, tolerance)?;

        // The backend already tried to place pages within tolerance, but it
        // might not account for the region end.
        let Some((location, _)) = mapping.find_region_in_tolerance(hint, size, tolerance) else {
            log::warn!(
                "backend reserved {:#x}..{:#x}, too far from {hint:#x} for {size:#x} bytes",
                mapping.from(),
                mapping.to(),
            );
            backend.release(mapping.from(), mapping.size());
            return Err(Error::Misplaced {
                address: mapping.from(),
                hint,
                tolerance,
            });
        };

        // Those pages belong to a live mapping, so they are not released.
        if mappings
            .iter()
            .any(|m| mapping.from() < m.to() && m.from() < mapping.to())
        {
            log::warn!(
                "backend reserved {:#x}..{:#x}, which is already in use",
                mapping.from(),
                mapping.to(),
            );
            return Err(Error::Overlapping {
                address: mapping.from(),
                end: mapping.to(),
            });
        }

        let range = mapping.acquire_region(location, size);
        let parent = mapping.from()..mapping.to();
        mappings.push(mapping);

        Ok(Region::new(range, parent, self))
    }

    /// Returns the index of the mapping with the gap closest to `hint` and
    /// the location of that gap. Only gaps strictly closer than `tolerance`
    /// count, and the first mapping found wins ties.
    fn find_closest(
        mappings: &[Mapping],
        hint: usize,
        size: usize,
        tolerance: usize,
    ) -> Option<(usize, usize)> {
        let mut best = None;
        let mut best_distance = tolerance;

        for (index, mapping) in mappings.iter().enumerate() {
            if mapping.size() < size {
                continue;
            }

            let Some((location, distance)) = mapping.find_region_in_tolerance(hint, size, tolerance)
            else {
                continue;
            };

            if distance < best_distance {
                best = Some((index, location));
                best_distance = distance;
            }
        }

        best
    }

    /// Requests enough pages to hold `size` bytes from the backend. The
    /// returned mapping is not registered yet.
    fn reserve_mapping(
        &self,
        backend: &mut B,
        hint: usize,
        size: usize,
        writable: bool,
        tolerance: usize,
    ) -> Result<Mapping> {
        let num_pages = pages_for(size, self.granularity);
        let exhausted = Error::Exhausted {
            hint,
            size,
            tolerance,
        };

        let Some(length) = num_pages.checked_mul(self.granularity) else {
            return Err(exhausted);
        };

        let address = backend.reserve_near(hint, tolerance, num_pages, writable)?;

        let Some(end) = address.checked_add(length) else {
            backend.release(address, length);
            return Err(Error::Misplaced {
                address,
                hint,
                tolerance,
            });
        };

        log::debug!(
            "reserved mapping {address:#x}..{end:#x} (writable: {writable}) near {hint:#x}"
        );

        Ok(Mapping::new(address, end, writable))
    }

    /// Releases the pages of `mapping` and forgets about it. Does nothing if
    /// the mapping is already gone.
    fn gc(state: &mut State<B>, mapping: usize) {
        let Some(index) = state.position(mapping) else {
            return;
        };

        let mapping = state.mappings.remove(index);
        log::debug!("releasing mapping {:#x}..{:#x}", mapping.from(), mapping.to());
        state.backend.release(mapping.from(), mapping.size());
    }

    /// Called by [`Region`] when it's dropped.
    pub(crate) fn release_region(&self, mapping: usize, from: usize) {
        let mut state = self.state.borrow_mut();

        let Some(index) = state.position(mapping) else {
            return;
        };

        if state.mappings[index].remove_region(from) {
            Self::gc(&mut state, mapping);
        }
    }

    pub(crate) fn shrink_region(&self, mapping: usize, from: usize, to: usize) {
        let mut state = self.state.borrow_mut();

        if let Some(index) = state.position(mapping) {
            state.mappings[index].shrink_region(from, to);
        }
    }

    pub(crate) fn is_writable(&self, mapping: usize) -> bool {
        let state = self.state.borrow();
        state
            .position(mapping)
            .is_some_and(|index| state.mappings[index].is_writable())
    }

    pub(crate) fn set_writable(&self, mapping: usize, writable: bool) {
        let mut state = self.state.borrow_mut();
        let State { mappings, backend } = &mut *state;

        if let Some(mapping) = mappings.iter_mut().find(|m| m.from() == mapping) {
            mapping.set_writable(writable, backend);
        }
    }
}

#[cfg(any(unix, windows))]
impl BlockAllocator<crate::platform::PlatformBackend> {
    /// Allocator that reserves pages directly from the operating system.
    pub fn platform() -> Self {
        Self::new(
            crate::platform::PlatformBackend::new(),
            crate::platform::page_size(),
        )
    }
}

impl<B: Backend> Drop for BlockAllocator<B> {
    fn drop(&mut self) {
        // Only reachable if regions were leaked with `mem::forget`. Their
        // memory might still be in use, so it stays mapped.
        let leaked = self.state.get_mut().mappings.len();
        if leaked > 0 {
            log::warn!("allocator dropped with {leaked} live mappings, leaving them mapped");
        }
    }
}

impl<B: Backend> fmt::Debug for BlockAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("BlockAllocator");
        debug.field("granularity", &self.granularity);
        debug.field("config", &self.config);

        match self.state.try_borrow() {
            Ok(state) => debug.field("mappings", &state.mappings),
            Err(_) => debug.field("mappings", &"<borrowed>"),
        };

        debug.finish()
    }
}
