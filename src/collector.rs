//! Collector lifecycle: the submission frontier and the cycle driver.
//!
//! One collector per process. Mutators hand over batches of retired
//! pointers through [`Collector::submit`] (or the [`retire`] fast path);
//! the collector thread sleeps on a condition variable until work arrives,
//! then runs one reclamation cycle: splice the carry-forward survivors
//! onto the new batches, map a working set, take the fork snapshot, let
//! the child scan, sweep in the parent, and refill the carry-forward chain
//! with whatever survived.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;

use atomic::Atomic;
use parking_lot::{Condvar, Mutex};

use crate::batch::{BatchChain, RetiredBatch};
use crate::config::{Config, ConfigError};
use crate::safepoint;
use crate::scanner;
use crate::snapshot::{self, Snapshot};
use crate::statistics::CollectorStatistics;
use crate::sweep;
use crate::tagged;
use crate::thread_data::{self, REGISTRY};
use crate::util::fatal;
use crate::working_set::WorkingSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Snapshot,
    Scan,
    Sweep,
}

struct Pending {
    head: Option<Box<RetiredBatch>>,
    waiting: bool,
    shutdown: bool,
}

#[derive(Default)]
struct Stats {
    cycles: AtomicUsize,
    scan_max: AtomicUsize,
    freed_blocks: AtomicUsize,
    freed_bytes: AtomicUsize,
    duplicates: AtomicUsize,
    carried: AtomicUsize,
}

pub struct Collector {
    config: Config,
    pending: Mutex<Pending>,
    wake: Condvar,
    phase: Atomic<Phase>,
    stats: Stats,
}

static INSTANCE: AtomicPtr<Collector> = AtomicPtr::new(null_mut());
static COLLECTOR_THREAD: Mutex<Option<std::thread::JoinHandle<()>>> = Mutex::new(None);

/// Install the safepoint handler and start the collector thread. Returns
/// the existing collector if one is already running; the configuration of
/// the first caller wins.
pub fn init(config: Config) -> Result<&'static Collector, ConfigError> {
    config.validate()?;

    let existing = INSTANCE.load(Ordering::Acquire);
    if !existing.is_null() {
        return Ok(unsafe { &*existing });
    }

    let collector: &'static Collector = Box::leak(Box::new(Collector {
        config,
        pending: Mutex::new(Pending {
            head: None,
            waiting: false,
            shutdown: false,
        }),
        wake: Condvar::new(),
        phase: Atomic::new(Phase::Idle),
        stats: Stats::default(),
    }));

    match INSTANCE.compare_exchange(
        null_mut(),
        collector as *const Collector as *mut Collector,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            safepoint::install_handler();
            match std::thread::Builder::new()
                .name("fission-collector".into())
                .spawn(move || {
                    // A panic here (worker spawn failure, poisoned state)
                    // would leave parked mutators waiting forever.
                    let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        collector.run_loop()
                    }));
                    if run.is_err() {
                        fatal!("collector thread panicked");
                    }
                })
            {
                Ok(handle) => *COLLECTOR_THREAD.lock() = Some(handle),
                Err(_) => fatal!("unable to spawn the collector thread"),
            }
            Ok(collector)
        }
        Err(raced) => Ok(unsafe { &*raced }),
    }
}

/// The process-wide collector, if `init` has run.
pub fn instance() -> Option<&'static Collector> {
    let p = INSTANCE.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

impl Collector {
    /// Hand a batch of retired pointers to the collector. Non-blocking
    /// beyond the list splice.
    pub fn submit(&self, mut batch: Box<RetiredBatch>) {
        if batch.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        batch.next = pending.head.take();
        pending.head = Some(batch);
        if pending.waiting {
            self.wake.notify_one();
        }
    }

    /// Flag the collector down, join its thread and kill any outstanding
    /// child scanner. An in-flight cycle completes first; pointers still
    /// pending or carried are not reclaimed.
    pub fn shutdown(&self) {
        {
            let mut pending = self.pending.lock();
            pending.shutdown = true;
        }
        self.wake.notify_one();
        let handle = COLLECTOR_THREAD.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        snapshot::kill_outstanding_child();
    }

    pub fn phase(&self) -> Phase {
        self.phase.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Completed reclamation cycles so far.
    pub fn cycles(&self) -> usize {
        self.stats.cycles.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> CollectorStatistics {
        CollectorStatistics {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            scan_max: self.stats.scan_max.load(Ordering::Relaxed),
            freed_blocks: self.stats.freed_blocks.load(Ordering::Relaxed),
            freed_bytes: self.stats.freed_bytes.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            carried: self.stats.carried.load(Ordering::Relaxed),
        }
    }

    /// Dump `statm:`, `fork-count:` and `scan-max:` to stdout.
    pub fn print_statistics(&self) {
        crate::statistics::print(&self.statistics());
    }

    fn run_loop(&self) {
        let mut carry = BatchChain::new();
        loop {
            let input = {
                let mut pending = self.pending.lock();
                loop {
                    if pending.shutdown {
                        return;
                    }
                    if pending.head.is_some() {
                        break;
                    }
                    pending.waiting = true;
                    self.wake.wait(&mut pending);
                    pending.waiting = false;
                }
                BatchChain::from_head(pending.head.take())
            };

            log::debug!("{} collects waiting", input.batch_count());
            let previous = std::mem::replace(&mut carry, BatchChain::new());
            carry = self.cycle(input, previous);
        }
    }

    /// One reclamation cycle. Returns the carry-forward chain for the
    /// next cycle.
    fn cycle(&self, input: BatchChain, carry: BatchChain) -> BatchChain {
        let mut chain = carry;
        chain.append(input);
        let count = chain.total();
        if count == 0 {
            return chain;
        }

        let started = Instant::now();
        // Snapshot the extra roots before anyone is parked: a parked
        // mutator may hold the region lock.
        let extra_roots = thread_data::root_regions();
        let mut ws = WorkingSet::with_capacity(count);

        self.phase.store(Phase::Snapshot, Ordering::Release);
        match snapshot::take(&REGISTRY) {
            Snapshot::Child(pipe) => {
                scanner::run_child(&mut ws, &chain, &REGISTRY, &extra_roots, &self.config, pipe)
            }
            Snapshot::Parent(child) => {
                self.phase.store(Phase::Scan, Ordering::Release);
                let bytes_scanned = child.recv_report();
                child.reap();
                self.stats
                    .scan_max
                    .fetch_max(bytes_scanned, Ordering::AcqRel);

                self.phase.store(Phase::Sweep, Ordering::Release);
                let outcome = sweep::sweep(&ws, &self.config);
                self.stats
                    .freed_blocks
                    .fetch_add(outcome.freed, Ordering::Relaxed);
                self.stats
                    .freed_bytes
                    .fetch_add(outcome.freed_bytes, Ordering::Relaxed);
                self.stats
                    .duplicates
                    .fetch_add(ws.duplicates(), Ordering::Relaxed);
                self.stats.carried.store(outcome.survivors, Ordering::Relaxed);

                chain.refill((0..ws.len()).map(|i| ws.addr(i)));

                // Counted once the cycle's results are published; one
                // fork per cycle, so this is also the fork count.
                self.stats.cycles.fetch_add(1, Ordering::AcqRel);

                if self.config.verbose {
                    log::info!(
                        "cycle {}: {} candidates, freed {} blocks ({} bytes) in {} passes, \
                         carried {}, scanned {} bytes in {:?}",
                        self.stats.cycles.load(Ordering::Relaxed),
                        count,
                        outcome.freed,
                        outcome.freed_bytes,
                        outcome.passes,
                        outcome.survivors,
                        bytes_scanned,
                        started.elapsed()
                    );
                }

                self.phase.store(Phase::Idle, Ordering::Release);
                chain
            }
        }
    }
}

/// Retire one heap pointer from the calling thread. The pointer must be a
/// live malloc block the caller promises never to dereference again; it is
/// buffered thread-locally and submitted as a batch once the buffer fills.
///
/// # Safety
///
/// `ptr` must come from the intercepted allocator and must not be used
/// after this call.
pub unsafe fn retire(ptr: *mut libc::c_void) {
    let addr = ptr as usize;
    debug_assert!(addr != 0 && addr & tagged::DEAD_BIT == 0);

    let td = thread_data::current();
    if td.is_null() {
        fatal!("retire called from an unregistered thread");
    }
    let collector = match instance() {
        Some(c) => c,
        None => fatal!("retire called before collector init"),
    };

    let buffer = &mut *(*td).retire_buffer.get();
    let batch = buffer.get_or_insert_with(|| RetiredBatch::new(collector.config.ptrs_per_thread));
    batch.push(addr);
    if batch.is_full() {
        let full = buffer.take().unwrap();
        collector.submit(full);
    }
}

/// Submit the calling thread's partially filled retire buffer right away
/// instead of waiting for it to fill.
pub fn flush_retired() {
    let td = thread_data::current();
    if td.is_null() {
        return;
    }
    let buffer = unsafe { &mut *(*td).retire_buffer.get() };
    if let Some(batch) = buffer.take() {
        if !batch.is_empty() {
            if let Some(collector) = instance() {
                collector.submit(batch);
            }
        }
    }
}
