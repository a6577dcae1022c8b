mod common;

use common::{SimulatedBackend, PAGE};
use execalloc::{BlockAllocator, Region};
use proptest::prelude::*;

const BASE: usize = 0x5000_0000_0000;

#[derive(Debug, Clone)]
enum Op {
    Allocate {
        hint: usize,
        size: usize,
        writable: bool,
        tolerance: usize,
    },
    Release(usize),
    Shrink(usize, usize),
    Seal(usize),
}

fn tolerance() -> impl Strategy<Value = usize> {
    prop_oneof![Just(usize::MAX), 4 * PAGE..64 * PAGE]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..64 * PAGE, 1..3 * PAGE, any::<bool>(), tolerance())
            .prop_map(|(offset, size, writable, tolerance)| Op::Allocate {
                hint: BASE + offset,
                size,
                writable,
                tolerance,
            }),
        2 => any::<usize>().prop_map(Op::Release),
        1 => (any::<usize>(), 1..PAGE).prop_map(|(index, size)| Op::Shrink(index, size)),
        1 => any::<usize>().prop_map(Op::Seal),
    ]
}

fn assert_disjoint(regions: &[Region<'_, SimulatedBackend>]) {
    let mut ranges = regions.iter().map(Region::range).collect::<Vec<_>>();
    ranges.sort_by_key(|range| range.start);

    for pair in ranges.windows(2) {
        assert!(pair[0].end <= pair[1].start, "{:#x?} overlaps {:#x?}", pair[0], pair[1]);
    }
}

proptest! {
    #[test]
    fn live_regions_never_overlap(ops in prop::collection::vec(op(), 1..64)) {
        let allocator = BlockAllocator::new(SimulatedBackend::new(), PAGE);
        let mut regions = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { hint, size, writable, tolerance } => {
                    let Ok(region) = allocator.get_region(hint, size, writable, tolerance) else {
                        continue;
                    };

                    prop_assert_eq!(region.size(), size);
                    prop_assert!(region.from().abs_diff(hint) <= tolerance);
                    prop_assert!(region.to().abs_diff(hint) <= tolerance);
                    prop_assert!(!writable || region.is_writable());

                    let mapping = region.mapping_range();
                    prop_assert!(mapping.start <= region.from() && region.to() <= mapping.end);
                    prop_assert_eq!(mapping.start % PAGE, 0);
                    prop_assert_eq!(mapping.end % PAGE, 0);

                    regions.push(region);
                }
                Op::Release(index) if !regions.is_empty() => {
                    regions.swap_remove(index % regions.len());
                }
                Op::Shrink(index, size) if !regions.is_empty() => {
                    let index = index % regions.len();
                    let region = &mut regions[index];
                    let before = region.range();

                    match region.resize(size) {
                        Ok(()) => {
                            prop_assert_eq!(region.range(), before.start..before.start + size);
                        }
                        Err(_) => {
                            prop_assert_eq!(region.range(), before);
                        }
                    }
                }
                Op::Seal(index) if !regions.is_empty() => {
                    let region = &regions[index % regions.len()];
                    region.set_writable(false);
                    prop_assert!(!region.is_writable());
                }
                _ => {}
            }

            assert_disjoint(&regions);

            let (live, all_used) = allocator.with_mappings(|mappings| {
                let live = mappings.iter().map(|m| m.region_count()).sum::<usize>();
                (live, mappings.iter().all(|m| m.region_count() > 0))
            });
            prop_assert_eq!(live, regions.len());
            prop_assert!(all_used);
        }

        drop(regions);

        prop_assert_eq!(allocator.mapping_count(), 0);
        prop_assert_eq!(allocator.with_backend(|backend| backend.reserved().count()), 0);
    }
}
