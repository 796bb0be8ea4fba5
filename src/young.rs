use im::Vector;

use crate::api::MIN_ALLOCATION;
use crate::generation::Generation;
use crate::header::HeapObjectHeader;
use crate::segment::Segment;

/// The young generation: a single bump segment that is evacuated on every collection cycle.
/// All survivors are copied out and promoted, so it never compacts in place.
pub struct YoungGen {
    segment: Segment,
    min_size: usize,
    max_size: usize,
    external_memory: usize,

    /// Cells with pending native cleanup, in allocation order. Entries either migrate to the
    /// old generation's list when the cell is promoted, or run their finalizer when the cell
    /// turns out unreachable.
    pub(crate) finalizable: Vector<*mut HeapObjectHeader>,

    /// Records the level at the end of the last collection; cells above it were allocated
    /// since.
    level_at_end_of_last_gc: *mut u8,

    // Cumulative statistics. The latter over the former yields the survival rate.
    pub(crate) cum_pre_bytes: usize,
    pub(crate) cum_promoted_bytes: usize,

    // Cumulative by-phase times within young-gen collection, in seconds.
    pub(crate) root_scan_secs: f64,
    pub(crate) evacuate_secs: f64,
    pub(crate) update_references_secs: f64,
    pub(crate) finalize_secs: f64,
}

impl YoungGen {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        let segment = Segment::reserve(crate::generation::adjust_size_with_bounds(min_size, min_size, max_size), max_size);
        let level = segment.level();
        Self {
            segment,
            min_size,
            max_size,
            external_memory: 0,
            finalizable: Vector::new(),
            level_at_end_of_last_gc: level,
            cum_pre_bytes: 0,
            cum_promoted_bytes: 0,
            root_scan_secs: 0.0,
            evacuate_secs: 0.0,
            update_references_secs: 0.0,
            finalize_secs: 0.0,
        }
    }

    /// Fast-path allocation; returns null on exhaustion without triggering collection.
    #[inline]
    pub fn alloc_raw(&mut self, size: usize) -> *mut u8 {
        debug_assert!(size % MIN_ALLOCATION == 0);
        self.segment.bump(size)
    }

    /// Grows the segment, within the sizing window, until `amount` more bytes fit. Returns
    /// false when even the maximum size cannot fit the request.
    pub fn grow_to_fit(&mut self, amount: usize) -> bool {
        if self.available() >= amount {
            return true;
        }
        let needed = self.segment.used() + self.external_memory + amount;
        let desired = self.adjust_size(needed);
        if desired < needed {
            return false;
        }
        if desired > self.size() {
            self.grow_to(desired);
        }
        self.available() >= amount
    }

    /// Bytes the mutator has allocated since the last collection finished.
    pub fn bytes_allocated_since_last_gc(&self) -> usize {
        self.segment.level() as usize - self.level_at_end_of_last_gc as usize
    }

    pub(crate) fn register_finalizable(&mut self, cell: *mut HeapObjectHeader) {
        self.finalizable.push_back(cell);
    }

    /// Resets the segment after a cycle: every survivor has been copied out.
    pub(crate) fn reset_after_collection(&mut self) {
        self.segment.reset_level(self.external_memory);
        self.level_at_end_of_last_gc = self.segment.level();
    }

    /// Observed survival rate across all cycles so far.
    pub fn survival_rate(&self) -> f64 {
        if self.cum_pre_bytes == 0 {
            return 0.0;
        }
        self.cum_promoted_bytes as f64 / self.cum_pre_bytes as f64
    }
}

impl Generation for YoungGen {
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
