//! Extent map for the container file
//!
//! Tracks every byte of the container as part of exactly one `Free` or `Used`
//! extent. Allocation is best-fit with optional payload alignment; when no
//! hole fits, the map grows at end-of-file.

use crate::error::{Result, ZFileError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contiguous byte range inside the container file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// Starting file offset
    pub start: u64,
    /// Number of bytes
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    /// One past the last byte of the extent
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Check if this extent contains a file offset
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// Check if this extent is adjacent to another (can be coalesced)
    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Coalesce two adjacent extents
    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }

        let start = self.start.min(other.start);
        let end = self.end().max(other.end());

        Some(Extent::new(start, end - start))
    }
}

/// Allocation state of an extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentState {
    Free,
    Used,
}

/// Where inside an allocation the aligned byte must land
///
/// ZIP entries are aligned on their payload, not on their local header, so
/// the allocator needs to know how many header bytes precede the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub alignment: u64,
    pub header_len: u64,
}

impl Placement {
    /// No alignment requirement
    pub fn unaligned() -> Self {
        Placement {
            alignment: 1,
            header_len: 0,
        }
    }

    pub fn aligned(alignment: u64, header_len: u64) -> Self {
        Placement {
            alignment: alignment.max(1),
            header_len,
        }
    }

    /// Lowest start `>= from` satisfying `(start + header_len) % alignment == 0`
    pub fn first_start_at(&self, from: u64) -> u64 {
        let alignment = self.alignment.max(1);
        let rem = (from + self.header_len) % alignment;
        if rem == 0 {
            from
        } else {
            from + (alignment - rem)
        }
    }
}

/// A move planned by [`ExtentMap::compact`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub from: Extent,
    pub to: Extent,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    length: u64,
    state: ExtentState,
}

/// Byte-level extent map covering `[0, size)`
///
/// Extents are indexed by start offset. The BTreeMap keeps them sorted so
/// neighbours can be found for coalescing and the trailing extent is cheap
/// to reach.
#[derive(Debug, Clone, Default)]
pub struct ExtentMap {
    slots: BTreeMap<u64, Slot>,
    size: u64,
}

impl ExtentMap {
    /// Create an empty map (zero-length file)
    pub fn new() -> Self {
        ExtentMap::default()
    }

    /// Create a map whose `size` bytes are all free
    pub fn with_free_space(size: u64) -> Self {
        let mut map = ExtentMap::new();
        map.grow_to(size);
        map
    }

    /// Logical file size covered by the map
    pub fn size(&self) -> u64 {
        self.size
    }

    /// End of the last used extent (0 if nothing is used)
    pub fn used_end(&self) -> u64 {
        self.slots
            .iter()
            .rev()
            .find(|(_, slot)| slot.state == ExtentState::Used)
            .map(|(&start, slot)| start + slot.length)
            .unwrap_or(0)
    }

    /// All extents in file order
    pub fn extents(&self) -> impl Iterator<Item = (Extent, ExtentState)> + '_ {
        self.slots
            .iter()
            .map(|(&start, slot)| (Extent::new(start, slot.length), slot.state))
    }

    pub fn free_bytes(&self) -> u64 {
        self.slots
            .values()
            .filter(|slot| slot.state == ExtentState::Free)
            .map(|slot| slot.length)
            .sum()
    }

    /// Share of the file occupied by holes before the last used byte
    ///
    /// 0.0 means the used extents are packed; trailing free space does not
    /// count since it is truncated on flush.
    pub fn fragmentation_score(&self) -> f64 {
        let used_end = self.used_end();
        if used_end == 0 {
            return 0.0;
        }

        let holes: u64 = self
            .slots
            .iter()
            .filter(|(&start, slot)| slot.state == ExtentState::Free && start < used_end)
            .map(|(_, slot)| slot.length)
            .sum();

        holes as f64 / used_end as f64
    }

    /// Allocate `size` bytes
    ///
    /// Best-fit: the smallest free extent that can hold the request after
    /// alignment wins, lowest offset on ties. Bytes skipped for alignment stay
    /// free. Falls back to growing the file.
    pub fn allocate(&mut self, size: u64, placement: Placement) -> Extent {
        if size == 0 {
            return Extent::new(self.size, 0);
        }

        let best_fit = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == ExtentState::Free)
            .filter_map(|(&start, slot)| {
                let at = placement.first_start_at(start);
                (at + size <= start + slot.length).then_some((start, slot.length, at))
            })
            .min_by_key(|&(start, length, _)| (length, start));

        let (slot_start, slot_len, at) = match best_fit {
            Some(found) => found,
            None => {
                let base = match self.slots.iter().next_back() {
                    Some((&start, slot)) if slot.state == ExtentState::Free => start,
                    _ => self.size,
                };
                let at = placement.first_start_at(base);
                self.grow_to(at + size);
                (base, self.size - base, at)
            }
        };

        let extent = Extent::new(at, size);
        self.split_free(slot_start, slot_len, extent);
        extent
    }

    /// Mark a specific range as used
    ///
    /// Used when rebuilding the map from an existing archive. Grows the map
    /// if the range lies past the current end.
    pub fn mark_used(&mut self, extent: Extent) -> Result<()> {
        if extent.is_empty() {
            return Ok(());
        }

        self.grow_to(extent.end());

        let (slot_start, slot) = self.slot_containing(extent.start).ok_or_else(|| {
            ZFileError::Allocation(format!("No extent contains offset {}", extent.start))
        })?;

        if slot.state != ExtentState::Free || extent.end() > slot_start + slot.length {
            return Err(ZFileError::Allocation(format!(
                "Range [{}, {}) overlaps a used extent",
                extent.start,
                extent.end()
            )));
        }

        self.split_free(slot_start, slot.length, extent);
        Ok(())
    }

    /// Release a used range, coalescing with free neighbours
    pub fn release(&mut self, extent: Extent) -> Result<()> {
        if extent.is_empty() {
            return Ok(());
        }

        let (slot_start, slot) = self.slot_containing(extent.start).ok_or_else(|| {
            ZFileError::Allocation(format!("No extent contains offset {}", extent.start))
        })?;

        if slot.state != ExtentState::Used || extent.end() > slot_start + slot.length {
            return Err(ZFileError::Allocation(format!(
                "Range [{}, {}) is not fully used",
                extent.start,
                extent.end()
            )));
        }

        self.free_within(slot_start, slot.length, extent);
        Ok(())
    }

    /// Plan moves of used extents into earlier holes
    ///
    /// Used extents are visited from the end of the file backward, each one
    /// at most once. `placement_of` returns the alignment constraint of an
    /// extent, or `None` to leave that extent where it is. A movable extent
    /// goes to the best-fitting hole before it; the target becomes used.
    ///
    /// Sources stay used: the old bytes may still be referenced on disk, so
    /// the caller releases each `from` once nothing points at it anymore.
    pub fn compact<F>(&mut self, mut placement_of: F) -> Vec<Relocation>
    where
        F: FnMut(Extent) -> Option<Placement>,
    {
        let candidates: Vec<Extent> = self
            .slots
            .iter()
            .rev()
            .filter(|(_, slot)| slot.state == ExtentState::Used)
            .map(|(&start, slot)| Extent::new(start, slot.length))
            .collect();

        let mut relocations = Vec::new();

        for source in candidates {
            let placement = match placement_of(source) {
                Some(p) => p,
                None => continue,
            };

            let target = self
                .slots
                .range(..source.start)
                .filter(|(_, slot)| slot.state == ExtentState::Free)
                .filter_map(|(&start, slot)| {
                    let at = placement.first_start_at(start);
                    (at + source.length <= start + slot.length).then_some((start, slot.length, at))
                })
                .min_by_key(|&(start, length, _)| (length, start));

            if let Some((slot_start, slot_len, at)) = target {
                let to = Extent::new(at, source.length);
                self.split_free(slot_start, slot_len, to);
                relocations.push(Relocation { from: source, to });
            }
        }

        relocations
    }

    /// Whether no byte of `extent` is used
    ///
    /// Bytes past the end of the map count as free.
    pub fn is_free(&self, extent: Extent) -> bool {
        if extent.is_empty() || extent.start >= self.size {
            return true;
        }

        match self.slot_containing(extent.start) {
            Some((start, slot)) => {
                let slot_end = start + slot.length;
                slot.state == ExtentState::Free
                    && (slot_end >= extent.end() || slot_end == self.size)
            }
            None => false,
        }
    }

    /// Drop a trailing free extent, shrinking the map; returns the new size
    pub fn truncate_trailing_free(&mut self) -> u64 {
        let trailing = match self.slots.iter().next_back() {
            Some((&start, slot)) if slot.state == ExtentState::Free => Some(start),
            _ => None,
        };

        if let Some(start) = trailing {
            self.slots.remove(&start);
            self.size = start;
        }

        self.size
    }

    /// Verify the coverage invariant
    ///
    /// Extents must tile `[0, size)` with no gaps, overlaps or empty
    /// extents, and no two free extents may be adjacent.
    pub fn check_invariants(&self) -> Result<()> {
        let mut expected_start = 0u64;
        let mut previous_free = false;

        for (&start, slot) in &self.slots {
            if start != expected_start {
                return Err(ZFileError::Allocation(format!(
                    "Extent starts at {} but previous ended at {}",
                    start, expected_start
                )));
            }
            if slot.length == 0 {
                return Err(ZFileError::Allocation(format!(
                    "Empty extent at {}",
                    start
                )));
            }

            let is_free = slot.state == ExtentState::Free;
            if is_free && previous_free {
                return Err(ZFileError::Allocation(format!(
                    "Adjacent free extents not coalesced at {}",
                    start
                )));
            }

            previous_free = is_free;
            expected_start = start + slot.length;
        }

        if expected_start != self.size {
            return Err(ZFileError::Allocation(format!(
                "Extents cover {} bytes but map size is {}",
                expected_start, self.size
            )));
        }

        Ok(())
    }

    fn slot_containing(&self, offset: u64) -> Option<(u64, Slot)> {
        self.slots
            .range(..=offset)
            .next_back()
            .filter(|(&start, slot)| offset < start + slot.length)
            .map(|(&start, slot)| (start, *slot))
    }

    /// Extend the map to `new_size` with free space
    fn grow_to(&mut self, new_size: u64) {
        if new_size <= self.size {
            return;
        }

        let grown = new_size - self.size;
        match self.slots.iter_mut().next_back() {
            Some((_, slot)) if slot.state == ExtentState::Free => slot.length += grown,
            _ => {
                self.slots.insert(
                    self.size,
                    Slot {
                        length: grown,
                        state: ExtentState::Free,
                    },
                );
            }
        }

        self.size = new_size;
    }

    /// Carve a used extent out of a known free slot
    fn split_free(&mut self, slot_start: u64, slot_len: u64, extent: Extent) {
        self.slots.remove(&slot_start);

        if extent.start > slot_start {
            self.slots.insert(
                slot_start,
                Slot {
                    length: extent.start - slot_start,
                    state: ExtentState::Free,
                },
            );
        }

        self.slots.insert(
            extent.start,
            Slot {
                length: extent.length,
                state: ExtentState::Used,
            },
        );

        let slot_end = slot_start + slot_len;
        if extent.end() < slot_end {
            self.slots.insert(
                extent.end(),
                Slot {
                    length: slot_end - extent.end(),
                    state: ExtentState::Free,
                },
            );
        }
    }

    /// Free part of a known used slot and coalesce
    fn free_within(&mut self, slot_start: u64, slot_len: u64, extent: Extent) {
        self.slots.remove(&slot_start);

        if extent.start > slot_start {
            self.slots.insert(
                slot_start,
                Slot {
                    length: extent.start - slot_start,
                    state: ExtentState::Used,
                },
            );
        }

        let slot_end = slot_start + slot_len;
        if extent.end() < slot_end {
            self.slots.insert(
                extent.end(),
                Slot {
                    length: slot_end - extent.end(),
                    state: ExtentState::Used,
                },
            );
        }

        self.insert_and_coalesce(extent);
    }

    /// Insert a free extent and coalesce with adjacent free extents
    fn insert_and_coalesce(&mut self, mut extent: Extent) {
        let mut to_remove = Vec::new();

        if let Some((&prev_start, prev)) = self.slots.range(..extent.start).next_back() {
            let prev_extent = Extent::new(prev_start, prev.length);
            if prev.state == ExtentState::Free {
                if let Some(merged) = prev_extent.coalesce(&extent) {
                    extent = merged;
                    to_remove.push(prev_start);
                }
            }
        }

        if let Some((&next_start, next)) = self.slots.range(extent.end()..).next() {
            let next_extent = Extent::new(next_start, next.length);
            if next.state == ExtentState::Free {
                if let Some(merged) = extent.coalesce(&next_extent) {
                    extent = merged;
                    to_remove.push(next_start);
                }
            }
        }

        for key in to_remove {
            self.slots.remove(&key);
        }

        self.slots.insert(
            extent.start,
            Slot {
                length: extent.length,
                state: ExtentState::Free,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(map: &ExtentMap) -> Vec<Extent> {
        map.extents()
            .filter(|(_, state)| *state == ExtentState::Used)
            .map(|(extent, _)| extent)
            .collect()
    }

    #[test]
    fn test_extent_coalesce() {
        let e1 = Extent::new(0, 10);
        let e2 = Extent::new(10, 5);
        assert!(e1.is_adjacent(&e2));
        assert_eq!(e1.coalesce(&e2), Some(Extent::new(0, 15)));
        assert_eq!(e1.coalesce(&Extent::new(20, 5)), None);
    }

    #[test]
    fn test_allocate_grows_file() {
        let mut map = ExtentMap::new();
        let a = map.allocate(100, Placement::unaligned());
        let b = map.allocate(50, Placement::unaligned());

        assert_eq!(a, Extent::new(0, 100));
        assert_eq!(b, Extent::new(100, 50));
        assert_eq!(map.size(), 150);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let mut map = ExtentMap::new();
        let a = map.allocate(100, Placement::unaligned());
        let _b = map.allocate(10, Placement::unaligned());
        let c = map.allocate(30, Placement::unaligned());
        let _d = map.allocate(10, Placement::unaligned());

        map.release(a).unwrap();
        map.release(c).unwrap();

        // Hole of 30 at 110 beats hole of 100 at 0
        let e = map.allocate(25, Placement::unaligned());
        assert_eq!(e.start, 110);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_release_coalesces_neighbours() {
        let mut map = ExtentMap::new();
        let a = map.allocate(10, Placement::unaligned());
        let b = map.allocate(10, Placement::unaligned());
        let c = map.allocate(10, Placement::unaligned());
        let _d = map.allocate(10, Placement::unaligned());

        map.release(a).unwrap();
        map.release(c).unwrap();
        map.release(b).unwrap();

        let free: Vec<_> = map
            .extents()
            .filter(|(_, state)| *state == ExtentState::Free)
            .collect();
        assert_eq!(free, vec![(Extent::new(0, 30), ExtentState::Free)]);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_alignment_leaves_free_padding() {
        let mut map = ExtentMap::new();
        map.allocate(7, Placement::unaligned());

        // Payload after a 30 byte header must land on a 16 byte boundary
        let e = map.allocate(40, Placement::aligned(16, 30));
        assert_eq!((e.start + 30) % 16, 0);
        assert_eq!(e.start, 18);

        let extents: Vec<_> = map.extents().collect();
        assert_eq!(extents[1], (Extent::new(7, 11), ExtentState::Free));
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_growth_reuses_trailing_free() {
        let mut map = ExtentMap::new();
        map.allocate(10, Placement::unaligned());
        let b = map.allocate(10, Placement::unaligned());
        map.release(b).unwrap();

        let c = map.allocate(30, Placement::unaligned());
        assert_eq!(c, Extent::new(10, 30));
        assert_eq!(map.size(), 40);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_mark_used_detects_overlap() {
        let mut map = ExtentMap::new();
        map.mark_used(Extent::new(10, 20)).unwrap();
        assert_eq!(map.size(), 30);

        assert!(matches!(
            map.mark_used(Extent::new(25, 10)),
            Err(ZFileError::Allocation(_))
        ));
        map.mark_used(Extent::new(0, 10)).unwrap();
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_release_requires_used_range() {
        let mut map = ExtentMap::with_free_space(100);
        assert!(map.release(Extent::new(0, 10)).is_err());
    }

    #[test]
    fn test_compact_moves_trailing_extent_into_hole() {
        let mut map = ExtentMap::new();
        let a = map.allocate(50, Placement::unaligned());
        let b = map.allocate(20, Placement::unaligned());
        let c = map.allocate(30, Placement::unaligned());
        map.release(a).unwrap();

        let moves = map.compact(|_| Some(Placement::unaligned()));

        assert_eq!(
            moves,
            vec![
                Relocation {
                    from: c,
                    to: Extent::new(0, 30)
                },
                Relocation {
                    from: b,
                    to: Extent::new(30, 20)
                },
            ]
        );

        // Sources are still reserved until the caller lets go of them
        assert_eq!(map.size(), 100);
        assert_eq!(map.free_bytes(), 0);

        for relocation in &moves {
            map.release(relocation.from).unwrap();
        }
        assert_eq!(map.truncate_trailing_free(), 50);
        assert_eq!(map.fragmentation_score(), 0.0);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_compact_skips_declined_extents() {
        let mut map = ExtentMap::new();
        let a = map.allocate(50, Placement::unaligned());
        let b = map.allocate(20, Placement::unaligned());
        let c = map.allocate(10, Placement::unaligned());
        map.release(a).unwrap();

        let moves = map.compact(|extent| (extent != c).then(Placement::unaligned));
        assert_eq!(
            moves,
            vec![Relocation {
                from: b,
                to: Extent::new(0, 20)
            }]
        );

        assert!(map.compact(|_| None).is_empty());
        assert_eq!(used(&map), vec![Extent::new(0, 20), b, c]);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_is_free() {
        let mut map = ExtentMap::new();
        let a = map.allocate(10, Placement::unaligned());
        map.allocate(10, Placement::unaligned());
        map.release(a).unwrap();

        assert!(map.is_free(Extent::new(0, 10)));
        assert!(map.is_free(Extent::new(2, 5)));
        assert!(!map.is_free(Extent::new(5, 10)));
        assert!(!map.is_free(Extent::new(10, 1)));
        assert!(map.is_free(Extent::new(20, 100)));
    }

    #[test]
    fn test_truncate_trailing_free() {
        let mut map = ExtentMap::new();
        map.allocate(10, Placement::unaligned());
        let b = map.allocate(10, Placement::unaligned());
        map.release(b).unwrap();

        assert_eq!(map.truncate_trailing_free(), 10);
        assert_eq!(map.used_end(), 10);
        map.check_invariants().unwrap();
    }
}
