use im::Vector;

use crate::api::MIN_ALLOCATION;
use crate::generation::Generation;
use crate::header::HeapObjectHeader;
use crate::segment::Segment;

/// The old generation: receives every object promoted out of the young generation. It is a
/// bump space like the young generation; it is reclaimed only by the full collection, which
/// evacuates its survivors into a fresh segment.
pub struct OldGen {
    segment: Segment,
    min_size: usize,
    max_size: usize,
    external_memory: usize,

    /// Cells with pending native cleanup. Entries arrive here when a finalizable young cell is
    /// promoted, and are consumed by the full collection.
    pub(crate) finalizable: Vector<*mut HeapObjectHeader>,
}

impl OldGen {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        let segment = Segment::reserve(
            crate::generation::adjust_size_with_bounds(min_size, min_size, max_size),
            max_size,
        );
        Self {
            segment,
            min_size,
            max_size,
            external_memory: 0,
            finalizable: Vector::new(),
        }
    }

    /// Allocation used while evacuating survivors into this generation. Null means the
    /// admission check upstream was violated; the caller treats that as fatal, never as a
    /// recoverable condition, since discovering it mid-evacuation would leave a half-moved
    /// heap.
    #[inline]
    pub(crate) fn promote(&mut self, size: usize) -> *mut u8 {
        debug_assert!(size % MIN_ALLOCATION == 0);
        self.segment.bump(size)
    }

    /// Direct allocation for requests that could never fit the young generation.
    #[inline]
    pub(crate) fn alloc_raw(&mut self, size: usize) -> *mut u8 {
        debug_assert!(size % MIN_ALLOCATION == 0);
        self.segment.bump(size)
    }

    pub(crate) fn register_finalizable(&mut self, cell: *mut HeapObjectHeader) {
        self.finalizable.push_back(cell);
    }

    /// Swaps in the evacuation target segment at the end of a full collection. The previous
    /// segment (now containing only forwarded husks) is returned to be dropped by the caller
    /// once reference updating is complete.
    pub(crate) fn replace_segment(&mut self, to_space: Segment) -> Segment {
        let old = std::mem::replace(&mut self.segment, to_space);
        let external = self.external_memory;
        self.segment.update_effective_limit(external);
        old
    }

    /// Reserves the evacuation target for a full collection: a fresh segment sized to hold
    /// `worst_case` bytes of survivors, clamped by this generation's sizing window.
    pub(crate) fn reserve_to_space(&self, worst_case: usize) -> Option<Segment> {
        if worst_case > self.max_size {
            return None;
        }
        let size = self.adjust_size(worst_case.max(self.size()));
        Some(Segment::reserve(size, self.max_size))
    }
}

impl Generation for OldGen {
    fn segment(&self) -> &Segment {
        &self.segment
    }
    fn segment_mut(&mut self) -> &mut Segment {
        &mut self.segment
    }
    fn min_size(&self) -> usize {
        self.min_size
    }
    fn max_size(&self) -> usize {
        self.max_size
    }
    fn external_memory(&self) -> usize {
        self.external_memory
    }
    fn set_external_memory(&mut self, bytes: usize) {
        self.external_memory = bytes;
    }
}
