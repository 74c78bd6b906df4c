//! Conservative scan of the frozen memory image (child process).
//!
//! Runs exclusively in the forked child. Builds the working set, then
//! walks every root region word by word: each pinned mutator's stack from
//! its parked stack pointer to the stack top, every registered root
//! region, and the body of every candidate block. Stack and root hits are
//! the external references that keep a candidate alive; candidate-body
//! hits are the heap-internal references the parent's transitive
//! decrement later subtracts, which is what lets cycles of dead blocks
//! fall to zero together.

use std::sync::atomic::{AtomicUsize, Ordering};

use scoped_threadpool::Pool;

use crate::batch::BatchChain;
use crate::config::Config;
use crate::snapshot::ScanPipe;
use crate::thread_data::ThreadList;
use crate::util::WORD_SIZE;
use crate::working_set::WorkingSet;

/// Upper bound on one scan task, in words. Keeps the task list short while
/// still splitting big stacks across workers.
const CHUNK_WORDS: usize = 64 * 1024;

pub(crate) fn run_child(
    ws: &mut WorkingSet,
    input: &BatchChain,
    registry: &ThreadList,
    extra_roots: &[(usize, usize)],
    config: &Config,
    pipe: ScanPipe,
) -> ! {
    ws.aggregate(input, config);

    let mut regions: Vec<(usize, usize)> = Vec::new();
    unsafe {
        // The registry lock is held by the parent's collector in this
        // image; the list is frozen and safe to walk without it.
        registry.iter_unlocked(|td| {
            let sp = td.saved_sp.load(Ordering::Relaxed);
            let low = if sp != 0 { sp } else { td.stack_low };
            if low < td.stack_high {
                regions.push((low, td.stack_high));
            }
        });
    }
    for &(low, high) in extra_roots {
        if low < high {
            regions.push((low, high));
        }
    }

    let bytes_scanned = scan(ws, &regions, config);

    pipe.send_report(bytes_scanned);
    drop(pipe);
    unsafe { libc::_exit(0) }
}

/// Walk all root regions and candidate bodies, incrementing the reference
/// count of every candidate whose address appears. Returns total bytes
/// scanned.
fn scan(ws: &WorkingSet, regions: &[(usize, usize)], config: &Config) -> usize {
    let mut chunks: Vec<(usize, usize)> = Vec::new();
    let mut bytes = 0usize;
    for &(low, high) in regions {
        let low = (low + WORD_SIZE - 1) & !(WORD_SIZE - 1);
        let high = high & !(WORD_SIZE - 1);
        if low >= high {
            continue;
        }
        bytes += high - low;
        let mut at = low;
        while at < high {
            let end = (at + CHUNK_WORDS * WORD_SIZE).min(high);
            chunks.push((at, end));
            at = end;
        }
    }
    for i in 0..ws.len() {
        bytes += ws.alloc_size(i);
    }

    let n = ws.len();
    let body_shards = (n + CHUNK_WORDS - 1) / CHUNK_WORDS;
    let tasks = chunks.len() + body_shards;
    let workers = config
        .max_workers
        .min(num_cpus::get())
        .min(tasks)
        .max(1);

    if workers == 1 {
        for &(low, high) in &chunks {
            scan_span(ws, low, high);
        }
        scan_bodies(ws, 0, n);
    } else {
        let next = AtomicUsize::new(0);
        let mut pool = Pool::new(workers as u32);
        pool.scoped(|scope| {
            for _ in 0..workers {
                let next = &next;
                let chunks = &chunks;
                scope.execute(move || loop {
                    let task = next.fetch_add(1, Ordering::Relaxed);
                    if task < chunks.len() {
                        let (low, high) = chunks[task];
                        scan_span(ws, low, high);
                    } else {
                        let shard = task - chunks.len();
                        if shard >= body_shards {
                            break;
                        }
                        let lo = shard * CHUNK_WORDS;
                        let hi = ((shard + 1) * CHUNK_WORDS).min(n);
                        scan_bodies(ws, lo, hi);
                    }
                });
            }
        });
    }

    bytes
}

/// Conservatively scan one word-aligned span.
fn scan_span(ws: &WorkingSet, low: usize, high: usize) {
    let mut at = low;
    while at < high {
        let word = unsafe { (at as *const usize).read() };
        if let Some(loc) = ws.lookup(word) {
            ws.refs(loc).fetch_add(1, Ordering::Relaxed);
        }
        at += WORD_SIZE;
    }
}

/// Scan the bodies of candidates `[lo, hi)`.
fn scan_bodies(ws: &WorkingSet, lo: usize, hi: usize) {
    for i in lo..hi {
        let addr = ws.addr(i);
        scan_span(ws, addr, addr + ws.alloc_size(i));
    }
}
