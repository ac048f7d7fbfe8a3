//! Property-based tests for the extent map and the container round trip
//!
//! Uses proptest to verify the coverage invariant across random allocation
//! sequences, and that random put/remove sequences survive a reopen.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::TempDir;
use zfile_rs::{CompressionMethod, Extent, ExtentMap, Placement, ZFile, ZFileOptions};

#[derive(Debug, Clone)]
enum MapOp {
    Allocate { size: u64, alignment: u64, header: u64 },
    Release(usize),
}

fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        3 => (1u64..10_000, prop::sample::select(vec![1u64, 4, 4096]), 0u64..64)
            .prop_map(|(size, alignment, header)| MapOp::Allocate { size, alignment, header }),
        1 => any::<usize>().prop_map(MapOp::Release),
    ]
}

#[derive(Debug, Clone)]
enum EntryOp {
    Put { name: usize, len: usize, fill: u8, stored: bool },
    Remove(usize),
    Update,
}

fn entry_op() -> impl Strategy<Value = EntryOp> {
    prop_oneof![
        4 => (0usize..8, 0usize..20_000, any::<u8>(), any::<bool>())
            .prop_map(|(name, len, fill, stored)| EntryOp::Put { name, len, fill, stored }),
        2 => (0usize..8).prop_map(EntryOp::Remove),
        1 => Just(EntryOp::Update),
    ]
}

proptest! {
    #[test]
    fn prop_extents_tile_the_file(ops in prop::collection::vec(map_op(), 1..60)) {
        let mut map = ExtentMap::new();
        let mut live: Vec<Extent> = Vec::new();

        for op in ops {
            match op {
                MapOp::Allocate { size, alignment, header } => {
                    let placement = Placement::aligned(alignment, header);
                    let extent = map.allocate(size, placement);

                    prop_assert_eq!(extent.length, size);
                    prop_assert_eq!((extent.start + header) % alignment, 0);
                    for other in &live {
                        prop_assert!(
                            extent.end() <= other.start || other.end() <= extent.start,
                            "{:?} overlaps {:?}", extent, other
                        );
                    }
                    live.push(extent);
                }
                MapOp::Release(index) => {
                    if !live.is_empty() {
                        let extent = live.swap_remove(index % live.len());
                        map.release(extent).unwrap();
                    }
                }
            }

            prop_assert!(map.check_invariants().is_ok());
        }

        let used: u64 = live.iter().map(|e| e.length).sum();
        prop_assert_eq!(map.size() - map.free_bytes(), used);
    }

    #[test]
    fn prop_compaction_keeps_coverage(
        sizes in prop::collection::vec(1u64..5_000, 2..30),
        released in prop::collection::vec(any::<bool>(), 2..30)
    ) {
        let mut map = ExtentMap::new();
        let mut live = Vec::new();

        for size in &sizes {
            live.push(map.allocate(*size, Placement::unaligned()));
        }
        let mut kept = Vec::new();
        for (extent, release) in live.into_iter().zip(released.iter().chain(std::iter::repeat(&false))) {
            if *release {
                map.release(extent).unwrap();
            } else {
                kept.push(extent);
            }
        }

        let relocations = map.compact(|_| Some(Placement::unaligned()));
        prop_assert!(map.check_invariants().is_ok());

        for relocation in &relocations {
            prop_assert!(relocation.to.end() <= relocation.from.start);
            prop_assert_eq!(relocation.to.length, relocation.from.length);
            for other in &relocations {
                prop_assert!(
                    relocation.to.end() <= other.from.start || other.from.end() <= relocation.to.start,
                    "{:?} lands on the source of {:?}", relocation, other
                );
            }
        }

        for relocation in &relocations {
            map.release(relocation.from).unwrap();
        }
        map.truncate_trailing_free();
        prop_assert!(map.check_invariants().is_ok());

        let used: u64 = kept.iter().map(|e| e.length).sum();
        prop_assert_eq!(map.size() - map.free_bytes(), used);
        prop_assert_eq!(map.used_end(), map.size());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_put_remove_survives_reopen(ops in prop::collection::vec(entry_op(), 1..40)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prop.zip");

        let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();

        for op in ops {
            match op {
                EntryOp::Put { name, len, fill, stored } => {
                    let name = format!("dir/entry{}.bin", name);
                    let data: Vec<u8> = (0..len).map(|i| fill.wrapping_add((i % 7) as u8)).collect();
                    let method = if stored { Some(CompressionMethod::Stored) } else { None };

                    zfile.put(&name, &data, method).unwrap();
                    model.insert(name, data);
                }
                EntryOp::Remove(name) => {
                    let name = format!("dir/entry{}.bin", name);
                    let removed = zfile.remove(&name).unwrap();
                    prop_assert_eq!(removed, model.remove(&name).is_some());
                }
                EntryOp::Update => zfile.update().unwrap(),
            }
        }
        zfile.close().unwrap();

        let reopened = ZFile::open(&path, ZFileOptions::default()).unwrap();
        prop_assert_eq!(reopened.len(), model.len());
        for (name, data) in &model {
            prop_assert_eq!(&reopened.read(name).unwrap(), data);
        }

        let stats = reopened.stats();
        prop_assert_eq!(stats.file_size, std::fs::metadata(&path).unwrap().len());
    }
}
