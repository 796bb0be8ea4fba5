use crate::api::MIN_ALLOCATION;
use crate::header::HeapObjectHeader;
use crate::mmap::Mmap;
use std::ptr::null_mut;

/// Alignment of segment windows. A generation's reserved range never exceeds one window, so
/// `contains` reduces to masking a pointer down to its window start.
pub const SEGMENT_ALIGNMENT: usize = 4 * 1024 * 1024;

/// Granule of all generation sizing decisions; min/max bounds and every grow/shrink target must
/// be a multiple of this.
pub const HEAP_ALIGN: usize = 4096;

/// A contiguous, aligned region of memory with a monotonic `level` pointer.
///
/// `low` and `low + max` bound the reserved address range, `limit` is the current end of the
/// allocatable window (moved by [`grow_to`](Segment::grow_to)/[`shrink_to`](Segment::shrink_to)),
/// and `level` is the next free address. The `effective_limit` additionally accounts for
/// external memory charged to the owning generation and is what the bump path checks against.
///
/// Invariant: `low <= level <= effective_limit <= limit <= low + max`.
pub struct Segment {
    map: Mmap,
    low: *mut u8,
    limit: *mut u8,
    effective_limit: *mut u8,
    level: *mut u8,
    max: usize,
}

impl Segment {
    /// Reserves a window of `max` bytes on a size-aligned boundary and opens the first `size`
    /// bytes of it for allocation.
    pub fn reserve(size: usize, max: usize) -> Self {
        assert!(size <= max, "initial size must not exceed the reservation");
        assert!(
            max <= SEGMENT_ALIGNMENT,
            "a generation cannot exceed one segment window"
        );
        assert!(size % HEAP_ALIGN == 0 && max % HEAP_ALIGN == 0);
        let map = Mmap::new(SEGMENT_ALIGNMENT * 2);
        let low = map.aligned();
        let limit = unsafe { low.add(size) };
        Self {
            map,
            low,
            limit,
            effective_limit: limit,
            level: low,
            max,
        }
    }

    /// Masks a pointer down to the start of the segment window containing it.
    #[inline(always)]
    pub fn window_of(ptr: *const u8) -> usize {
        ptr as usize & !(SEGMENT_ALIGNMENT - 1)
    }

    /// O(1) containment via address-range masking.
    #[inline(always)]
    pub fn contains(&self, ptr: *const u8) -> bool {
        Self::window_of(ptr) == self.low as usize
    }

    #[inline(always)]
    pub fn low(&self) -> *mut u8 {
        self.low
    }

    #[inline(always)]
    pub fn level(&self) -> *mut u8 {
        self.level
    }

    /// Current size of the allocatable window in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.limit as usize - self.low as usize
    }

    /// Bytes already handed out.
    #[inline(always)]
    pub fn used(&self) -> usize {
        self.level as usize - self.low as usize
    }

    /// Bytes still available to the bump path, after external-memory charges.
    #[inline(always)]
    pub fn available(&self) -> usize {
        self.effective_limit as usize - self.level as usize
    }

    /// Bump-allocates `size` bytes. Returns null when the effective window is exhausted; it
    /// never blocks and never triggers collection itself.
    #[inline]
    pub fn bump(&mut self, size: usize) -> *mut u8 {
        debug_assert!(size % MIN_ALLOCATION == 0);
        unsafe {
            let result = self.level;
            let new_level = result.add(size);
            if new_level > self.effective_limit {
                return null_mut();
            }
            self.level = new_level;
            result
        }
    }

    /// Moves `limit` up to `low + size`. The target must already be clamped by the owning
    /// generation's sizing policy.
    pub fn grow_to(&mut self, size: usize, external: usize) {
        assert!(size % HEAP_ALIGN == 0, "unaligned segment size");
        assert!(size <= self.max, "segment size outside reserved window");
        assert!(size >= self.size(), "grow_to cannot shrink the segment");
        self.limit = unsafe { self.low.add(size) };
        self.map.commit(self.low, size);
        self.update_effective_limit(external);
    }

    /// Moves `limit` down to `low + size`. Shrinking below `used()` is a contract violation.
    pub fn shrink_to(&mut self, size: usize, external: usize) {
        assert!(size % HEAP_ALIGN == 0, "unaligned segment size");
        assert!(
            size >= self.used(),
            "cannot shrink a segment below its live data"
        );
        if self.size() <= size {
            return;
        }
        unsafe {
            let new_limit = self.low.add(size);
            self.map
                .dontneed(new_limit, self.limit as usize - new_limit as usize);
            self.limit = new_limit;
        }
        self.update_effective_limit(external);
    }

    /// Re-derives the effective end of the window from the external-memory charge. The
    /// effective end never drops below `level`.
    pub fn update_effective_limit(&mut self, external: usize) {
        let effective_size = self.size().saturating_sub(external);
        let effective = unsafe { self.low.add(effective_size) };
        self.effective_limit = if effective < self.level {
            self.level
        } else {
            effective
        };
    }

    /// Resets `level` to the low bound; everything surviving has been copied out.
    pub fn reset_level(&mut self, external: usize) {
        self.level = self.low;
        self.update_effective_limit(external);
    }

    /// Walks every cell between `low` and `level` in allocation order.
    pub fn for_each_cell(&self, callback: &mut dyn FnMut(*mut HeapObjectHeader)) {
        let mut cursor = self.low;
        while cursor < self.level {
            let header = cursor.cast::<HeapObjectHeader>();
            let size = unsafe { (*header).size() };
            debug_assert!(size != 0, "walked into an uninitialized cell");
            callback(header);
            cursor = unsafe { cursor.add(size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_advances_level_and_fails_at_limit() {
        let mut seg = Segment::reserve(HEAP_ALIGN, HEAP_ALIGN * 4);
        let a = seg.bump(64);
        assert!(!a.is_null());
        assert_eq!(seg.used(), 64);
        let b = seg.bump(HEAP_ALIGN);
        assert!(b.is_null());
        assert_eq!(seg.used(), 64);
    }

    #[test]
    fn contains_is_derivable_by_masking() {
        let mut seg = Segment::reserve(HEAP_ALIGN, HEAP_ALIGN);
        let p = seg.bump(64);
        assert!(seg.contains(p));
        assert!(seg.contains(unsafe { p.add(HEAP_ALIGN - 1) }));
        let other = Segment::reserve(HEAP_ALIGN, HEAP_ALIGN);
        assert!(!other.contains(p));
    }

    #[test]
    fn grow_and_shrink_move_the_limit() {
        let mut seg = Segment::reserve(HEAP_ALIGN, HEAP_ALIGN * 4);
        assert_eq!(seg.size(), HEAP_ALIGN);
        seg.grow_to(HEAP_ALIGN * 4, 0);
        assert_eq!(seg.size(), HEAP_ALIGN * 4);
        seg.bump(128);
        seg.shrink_to(HEAP_ALIGN, 0);
        assert_eq!(seg.size(), HEAP_ALIGN);
        assert_eq!(seg.used(), 128);
    }

    #[test]
    #[should_panic]
    fn shrink_below_usage_is_fatal() {
        let mut seg = Segment::reserve(HEAP_ALIGN * 2, HEAP_ALIGN * 2);
        for _ in 0..HEAP_ALIGN / 64 {
            seg.bump(128);
        }
        seg.shrink_to(HEAP_ALIGN, 0);
    }

    #[test]
    fn external_memory_moves_the_effective_limit() {
        let mut seg = Segment::reserve(HEAP_ALIGN * 2, HEAP_ALIGN * 2);
        assert_eq!(seg.available(), HEAP_ALIGN * 2);
        seg.update_effective_limit(HEAP_ALIGN);
        assert_eq!(seg.available(), HEAP_ALIGN);
        seg.update_effective_limit(0);
        assert_eq!(seg.available(), HEAP_ALIGN * 2);
    }
}
