//! # Fission
//!
//! Fission is a fork-snapshot memory reclamation engine for threaded
//! programs that manage raw heap pointers. Threads *retire* pointers they
//! will never dereference again; the collector decides, conservatively and
//! without stopping the world for long, which retired pointers are truly
//! unreachable and hands them back to the allocator.
//!
//! # How a cycle works
//! - Mutators submit batches of retired pointers; a dedicated collector
//!   thread wakes when work arrives.
//! - The collector parks every registered mutator at a signal-delivered
//!   safepoint (each spills its registers onto its own stack), then forks.
//!   The copy-on-write child is a frozen snapshot of every stack and the
//!   whole heap; mutators resume as soon as the fork returns.
//! - The child sorts the candidate set into a shared working set, scans
//!   all roots and candidate bodies word by word, counts apparent
//!   references, reports, and exits.
//! - The parent sweeps: candidates with no references are freed, their
//!   bodies' own references are retracted transitively so dead cycles
//!   collapse, and the survivors are carried into the next cycle.
//!
//! # Example
//!
//! ```no_run
//! fission::init(fission::Config::default()).unwrap();
//! fission::register_current_thread();
//!
//! unsafe {
//!     let block = libc::malloc(64);
//!     // ... publish, use, unlink ...
//!     fission::retire(block);
//! }
//! fission::flush_retired();
//! ```

pub mod batch;
pub mod collector;
pub mod config;
mod context;
mod mem;
mod safepoint;
mod scanner;
mod snapshot;
mod sort;
pub mod statistics;
mod sweep;
pub mod tagged;
pub mod thread_data;
mod util;
mod working_set;

pub use batch::RetiredBatch;
pub use collector::{flush_retired, init, instance, retire, Collector, Phase};
pub use config::{Config, ConfigError};
pub use safepoint::{wait_for_snapshot, DeferSafepoint, SAFEPOINT_SIGNAL};
pub use statistics::CollectorStatistics;
pub use thread_data::{
    register_current_thread, register_root_region, register_thread, unregister_thread,
};

/// Dump the collector's diagnostic lines to stdout. A process that never
/// ran `init` reports zeroed counters.
pub fn print_statistics() {
    match collector::instance() {
        Some(c) => c.print_statistics(),
        None => statistics::print(&CollectorStatistics {
            cycles: 0,
            scan_max: 0,
            freed_blocks: 0,
            freed_bytes: 0,
            duplicates: 0,
            carried: 0,
        }),
    }
}
