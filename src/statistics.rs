/// Point-in-time snapshot of the collector, renderable as structured text for operational
/// monitoring.
pub struct HeapStatistics {
    pub young_size: usize,
    pub young_used: usize,
    pub young_external: usize,
    pub old_size: usize,
    pub old_used: usize,
    pub old_external: usize,
    pub minor_collections: usize,
    pub full_collections: usize,
    pub bytes_promoted_total: usize,
    pub bytes_allocated_since_last_gc: usize,
    /// Fraction of pre-collection young-generation bytes that survived, cumulative.
    pub survival_rate: f64,
    pub root_scan_secs: f64,
    pub evacuate_secs: f64,
    pub update_references_secs: f64,
    pub finalize_secs: f64,
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Young generation: {} of {} used ({} external)",
            formatted_size(self.young_used),
            formatted_size(self.young_size),
            formatted_size(self.young_external)
        )?;
        writeln!(
            f,
            "  Old generation: {} of {} used ({} external)",
            formatted_size(self.old_used),
            formatted_size(self.old_size),
            formatted_size(self.old_external)
        )?;
        writeln!(
            f,
            "  Collections: {} young, {} full",
            self.minor_collections, self.full_collections
        )?;
        writeln!(
            f,
            "  Total bytes promoted: {}",
            formatted_size(self.bytes_promoted_total)
        )?;
        writeln!(
            f,
            "  Allocated since last collection: {}",
            formatted_size(self.bytes_allocated_since_last_gc)
        )?;
        writeln!(f, "  Survival rate: {:.2}%", self.survival_rate * 100.0)?;
        writeln!(
            f,
            "  Phase times: roots {:.4}s, evacuate {:.4}s, refs {:.4}s, finalize {:.4}s",
            self.root_scan_secs,
            self.evacuate_secs,
            self.update_references_secs,
            self.finalize_secs
        )?;
        Ok(())
    }
}
