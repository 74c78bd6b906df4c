//! Cycle statistics and stdout diagnostics.

use crate::util::fatal;

/// Point-in-time snapshot of the collector's counters.
pub struct CollectorStatistics {
    /// Completed snapshot forks.
    pub cycles: usize,
    /// Peak bytes scanned by any single child.
    pub scan_max: usize,
    pub freed_blocks: usize,
    pub freed_bytes: usize,
    /// Duplicate retirements collapsed at aggregation.
    pub duplicates: usize,
    /// Survivors carried into the next cycle, as of the last sweep.
    pub carried: usize,
}

struct FormattedSize {
    size: usize,
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

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for CollectorStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Collector statistics:")?;
        writeln!(f, "  Reclamation cycles: {}", self.cycles)?;
        writeln!(
            f,
            "  Peak bytes scanned per cycle: {}",
            formatted_size(self.scan_max)
        )?;
        writeln!(
            f,
            "  Blocks released: {} ({})",
            self.freed_blocks,
            formatted_size(self.freed_bytes)
        )?;
        writeln!(f, "  Duplicate retirements collapsed: {}", self.duplicates)?;
        writeln!(f, "  Candidates carried forward: {}", self.carried)?;
        Ok(())
    }
}

/// Dump the diagnostic lines to stdout: the process memory summary from
/// `/proc/self/statm`, the fork count, and the scan high-water mark.
pub(crate) fn print(stats: &CollectorStatistics) {
    let statm = match std::fs::read_to_string("/proc/self/statm") {
        Ok(s) => s,
        Err(_) => fatal!("unable to open /proc/self/statm"),
    };

    println!("statm: {}", statm.trim_end());
    println!("fork-count: {}", stats.cycles);
    println!("scan-max: {}", stats.scan_max);
}
