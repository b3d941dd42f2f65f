//! Bump sub-allocation over a fixed-size memory block.
//!
//! `SubAllocator` is pure bookkeeping: it hands out non-overlapping, aligned
//! byte ranges from a single block and never touches Vulkan handles, so the
//! allocation logic is testable without a device. Allocation records live in
//! a stable arena indexed by `SubAlloc::index`; freed records are marked
//! invalid and queued, but their bytes are not reclaimed until a compaction
//! pass runs.
//!
//! The allocator requires external synchronization; the renderer is the only
//! caller and runs on a single thread.

/// Round `offset` up to the next multiple of `alignment`.
///
/// `alignment` must be non-zero. Vulkan alignments are powers of two, but
/// the computation does not rely on that.
#[inline]
pub const fn align_up(offset: u64, alignment: u64) -> u64 {
    let rem = offset % alignment;
    if rem == 0 {
        offset
    } else {
        offset + (alignment - rem)
    }
}

/// Handle to one sub-allocated range.
///
/// Carries a copy of the range so hot paths can avoid the arena lookup;
/// `index` is the authoritative identity used for `free`/validity checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubAlloc {
    /// Index of the record in the owning allocator.
    pub index: u32,
    /// Byte offset of the range within the block.
    pub offset: u64,
    /// Size of the range in bytes.
    pub size: u64,
    /// Alignment the range was allocated with.
    pub alignment: u64,
}

#[derive(Clone, Copy, Debug)]
struct Record {
    offset: u64,
    size: u64,
    live: bool,
}

/// Forward-only bump allocator over one fixed-size block.
#[derive(Debug)]
pub struct SubAllocator {
    block_size: u64,
    cursor: u64,
    records: Vec<Record>,
    /// Indices of freed records, kept for a future compaction pass.
    free_list: Vec<u32>,
}

impl SubAllocator {
    /// Create an allocator over a block of `block_size` bytes.
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            cursor: 0,
            records: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Check whether a range of `size` bytes at `alignment` fits.
    ///
    /// Does not mutate allocator state: repeated calls with the same
    /// arguments return the same result until an intervening `allocate`.
    pub fn can_allocate(&self, alignment: u64, size: u64) -> bool {
        let aligned = align_up(self.cursor, alignment);
        // Guard the addition; an absurd size must fail, not wrap.
        match aligned.checked_add(size) {
            Some(end) => end <= self.block_size,
            None => false,
        }
    }

    /// Allocate `size` bytes at `alignment`.
    ///
    /// Returns `None` when the block is exhausted; the caller decides
    /// whether that is fatal. Offsets of live records are never reused.
    pub fn allocate(&mut self, alignment: u64, size: u64) -> Option<SubAlloc> {
        if !self.can_allocate(alignment, size) {
            return None;
        }

        let offset = align_up(self.cursor, alignment);
        self.cursor = offset + size;

        let index = self.records.len() as u32;
        self.records.push(Record {
            offset,
            size,
            live: true,
        });

        Some(SubAlloc {
            index,
            offset,
            size,
            alignment,
        })
    }

    /// Mark an allocation as freed.
    ///
    /// The bytes remain bump-allocated until `pack` reclaims them. Freeing
    /// an unknown or already-freed index is a caller bug and is reported.
    pub fn free(&mut self, index: u32) -> std::result::Result<(), FreeError> {
        let record = self
            .records
            .get_mut(index as usize)
            .ok_or(FreeError::UnknownIndex(index))?;
        if !record.live {
            return Err(FreeError::AlreadyFreed(index));
        }
        record.live = false;
        self.free_list.push(index);
        Ok(())
    }

    /// Compaction hook.
    ///
    /// Physically reclaiming freed ranges would move live allocations and
    /// invalidate every outstanding GPU reference into the block, which
    /// requires a full device drain. The allocator is therefore grow-only:
    /// `pack` only reports how many bytes a compaction pass would recover.
    pub fn pack(&self) -> u64 {
        self.free_list
            .iter()
            .filter_map(|&i| self.records.get(i as usize))
            .map(|r| r.size)
            .sum()
    }

    /// Whether the record at `index` exists and is live.
    pub fn is_live(&self, index: u32) -> bool {
        self.records
            .get(index as usize)
            .is_some_and(|r| r.live)
    }

    /// Total size of the block in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Current bump cursor (bytes consumed, including padding).
    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Bytes remaining before the bump cursor reaches the block end.
    pub fn remaining(&self) -> u64 {
        self.block_size - self.cursor
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| r.live).count()
    }
}

/// Errors from `SubAllocator::free`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FreeError {
    /// The index does not name any record.
    #[error("unknown allocation index {0}")]
    UnknownIndex(u32),
    /// The record was already freed.
    #[error("allocation {0} already freed")]
    AlreadyFreed(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(100, 16), 112);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut alloc = SubAllocator::new(4096);
        let sizes = [(16u64, 100u64), (64, 30), (4, 7), (256, 512), (16, 1)];

        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for &(align, size) in &sizes {
            assert!(alloc.can_allocate(align, size));
            let sub = alloc.allocate(align, size).unwrap();
            assert_eq!(sub.offset % align, 0);
            ranges.push((sub.offset, sub.offset + sub.size));
        }

        for (i, &(a_start, a_end)) in ranges.iter().enumerate() {
            for &(b_start, b_end) in &ranges[i + 1..] {
                assert!(a_end <= b_start || b_end <= a_start, "ranges overlap");
            }
        }
    }

    #[test]
    fn can_allocate_is_idempotent() {
        let alloc = SubAllocator::new(256);
        assert!(alloc.can_allocate(16, 100));
        assert!(alloc.can_allocate(16, 100));
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn exhaustion_after_padding() {
        // 100 bytes at alignment 16 bumps the cursor to 100; the next
        // 16-aligned offset is 112, and 112 + 200 > 256.
        let mut alloc = SubAllocator::new(256);
        let first = alloc.allocate(16, 100).unwrap();
        assert_eq!(first.offset, 0);
        assert!(!alloc.can_allocate(16, 200));
        assert!(alloc.allocate(16, 200).is_none());
        // A smaller request still fits.
        assert!(alloc.can_allocate(16, 144));
    }

    #[test]
    fn exact_fit_succeeds() {
        let mut alloc = SubAllocator::new(256);
        let sub = alloc.allocate(16, 256).unwrap();
        assert_eq!(sub.offset, 0);
        assert_eq!(alloc.remaining(), 0);
        assert!(!alloc.can_allocate(1, 1));
    }

    #[test]
    fn free_marks_invalid_without_reclaiming() {
        let mut alloc = SubAllocator::new(1024);
        let a = alloc.allocate(16, 512).unwrap();
        alloc.free(a.index).unwrap();
        assert!(!alloc.is_live(a.index));
        // Bump cursor is unchanged; the freed space is not reusable.
        assert_eq!(alloc.used(), 512);
        assert!(!alloc.can_allocate(16, 1024));
        assert_eq!(alloc.pack(), 512);
    }

    #[test]
    fn double_free_is_reported() {
        let mut alloc = SubAllocator::new(64);
        let a = alloc.allocate(4, 8).unwrap();
        alloc.free(a.index).unwrap();
        assert_eq!(alloc.free(a.index), Err(FreeError::AlreadyFreed(a.index)));
        assert_eq!(alloc.free(99), Err(FreeError::UnknownIndex(99)));
    }

    #[test]
    fn offsets_are_never_reused() {
        let mut alloc = SubAllocator::new(1024);
        let a = alloc.allocate(16, 64).unwrap();
        alloc.free(a.index).unwrap();
        let b = alloc.allocate(16, 64).unwrap();
        assert_ne!(a.offset, b.offset);
        assert!(b.offset >= a.offset + a.size);
    }

    #[test]
    fn oversized_request_does_not_wrap() {
        let alloc = SubAllocator::new(256);
        assert!(!alloc.can_allocate(16, u64::MAX));
    }
}
