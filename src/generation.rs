use crate::header::HeapObjectHeader;
use crate::segment::{Segment, HEAP_ALIGN};

/// Pure sizing policy shared by both generations: clamp `desired` into `[min, max]`, then
/// round up to the sizing granule. Idempotent, because `min` and `max` are themselves
/// granule-aligned.
pub fn adjust_size_with_bounds(desired: usize, min: usize, max: usize) -> usize {
    assert!(min <= max, "the max must be at least the min size");
    assert!(
        min % HEAP_ALIGN == 0 && max % HEAP_ALIGN == 0,
        "generation bounds must be aligned"
    );
    let clamped = desired.clamp(min, max);
    crate::align_usize(clamped, HEAP_ALIGN)
}

/// Capability surface of a heap generation: a segment with a sizing window, external-memory
/// accounting, and iteration over live cells. The collection algorithms themselves live in the
/// orchestrator; a generation only owns space.
pub trait Generation {
    fn segment(&self) -> &Segment;
    fn segment_mut(&mut self) -> &mut Segment;
    fn min_size(&self) -> usize;
    fn max_size(&self) -> usize;
    fn external_memory(&self) -> usize;
    fn set_external_memory(&mut self, bytes: usize);

    fn size(&self) -> usize {
        self.segment().size()
    }

    /// Used bytes, counting external memory charged to this generation.
    fn used(&self) -> usize {
        self.segment().used() + self.external_memory()
    }

    fn available(&self) -> usize {
        self.segment().available()
    }

    /// Segment size minus external memory; the space the generation effectively offers.
    fn effective_size(&self) -> usize {
        self.size().saturating_sub(self.external_memory())
    }

    fn contains(&self, ptr: *const u8) -> bool {
        self.segment().contains(ptr)
    }

    fn adjust_size(&self, desired: usize) -> usize {
        adjust_size_with_bounds(desired, self.min_size(), self.max_size())
    }

    /// Grows the segment window to `desired` bytes. The target must come out of
    /// [`adjust_size`](Generation::adjust_size); anything else is a contract violation.
    fn grow_to(&mut self, desired: usize) {
        assert!(
            desired == self.adjust_size(desired),
            "grow target must be pre-clamped by the sizing policy"
        );
        let external = self.external_memory();
        self.segment_mut().grow_to(desired, external);
    }

    /// Shrinks the segment window to `desired` bytes; shrinking below current usage is a
    /// contract violation.
    fn shrink_to(&mut self, desired: usize) {
        assert!(
            desired == self.adjust_size(desired),
            "shrink target must be pre-clamped by the sizing policy"
        );
        assert!(desired >= self.used(), "cannot shrink below live data");
        let external = self.external_memory();
        self.segment_mut().shrink_to(desired, external);
    }

    /// Credits `bytes` of off-heap memory logically owned by cells of this generation,
    /// shrinking the space available for allocation.
    fn credit_external_memory(&mut self, bytes: usize) {
        let external = self.external_memory() + bytes;
        self.set_external_memory(external);
        self.segment_mut().update_effective_limit(external);
    }

    /// Releases a previous external-memory credit. Credits and debits must be paired by the
    /// object lifecycle owning the off-heap buffer; an excess debit is a contract violation.
    fn debit_external_memory(&mut self, bytes: usize) {
        let external = self.external_memory();
        assert!(bytes <= external, "unbalanced external memory debit");
        let external = external - bytes;
        self.set_external_memory(external);
        self.segment_mut().update_effective_limit(external);
    }

    /// Iterates every live cell of the generation, in allocation order. Used by diagnostics,
    /// not by the collector.
    fn for_all_objects(&self, callback: &mut dyn FnMut(*mut HeapObjectHeader)) {
        self.segment().for_each_cell(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_size_clamps_and_aligns() {
        let min = HEAP_ALIGN * 2;
        let max = HEAP_ALIGN * 16;
        assert_eq!(adjust_size_with_bounds(0, min, max), min);
        assert_eq!(adjust_size_with_bounds(usize::MAX, min, max), max);
        assert_eq!(
            adjust_size_with_bounds(HEAP_ALIGN * 3 + 17, min, max),
            HEAP_ALIGN * 4
        );
    }

    #[test]
    fn adjust_size_is_idempotent() {
        let min = HEAP_ALIGN * 2;
        let max = HEAP_ALIGN * 16;
        for desired in [0, min, min + 1, HEAP_ALIGN * 7 + 9, max, max + 12345] {
            let once = adjust_size_with_bounds(desired, min, max);
            assert_eq!(adjust_size_with_bounds(once, min, max), once);
            assert!((min..=max).contains(&once));
        }
    }
}
