//! Transitive-decrement sweep over the scanned working set (parent).
//!
//! After the child's report, `refs[i]` counts every apparent reference to
//! candidate `i`: from mutator stacks, registered roots, and other
//! candidates' bodies. A candidate nobody references is garbage; freeing
//! it removes its body's contributions from the counts, which can expose
//! further garbage, including cycles of dead blocks whose mutual counts
//! fall away together. Workers claim roots with the dead-bit CAS so each
//! candidate is swept at most once, recursion is depth-capped, and an
//! outer fixpoint rescans until a pass claims nothing new.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use scoped_threadpool::Pool;

use crate::config::Config;
use crate::mem;
use crate::sort;
use crate::tagged;
use crate::util::WORD_SIZE;
use crate::working_set::WorkingSet;

pub(crate) struct SweepOutcome {
    pub passes: usize,
    pub freed: usize,
    pub freed_bytes: usize,
    pub survivors: usize,
}

/// Number of sweep workers for `n` candidates: one per
/// `addrs_per_worker` shard, at least one, at most `max_workers`.
fn worker_count(n: usize, config: &Config) -> usize {
    ((n + config.addrs_per_worker - 1) / config.addrs_per_worker)
        .max(1)
        .min(config.max_workers)
}

pub(crate) fn sweep(ws: &WorkingSet, config: &Config) -> SweepOutcome {
    let mut outcome = SweepOutcome {
        passes: 0,
        freed: 0,
        freed_bytes: 0,
        survivors: 0,
    };
    if ws.len() == 0 {
        return outcome;
    }

    // Quick-reject bounds for the transitive walk, fixed across all
    // passes. Survivor addresses always lie inside the initial range, so
    // recomputing from the compacted array would only narrow the window
    // incorrectly.
    let bounds = ws.bounds();
    let freed_bytes = CachePadded::new(AtomicUsize::new(0));

    let pool_size = worker_count(ws.len(), config);
    let mut pool = Pool::new(pool_size as u32);

    loop {
        outcome.passes += 1;
        run_pass(ws, bounds, config, &mut pool, &freed_bytes);
        let savings = compact(ws);
        outcome.freed += savings;
        if savings == 0 || ws.len() == 0 {
            break;
        }
    }

    outcome.freed_bytes = freed_bytes.load(Ordering::Relaxed);
    outcome.survivors = ws.len();
    outcome
}

fn run_pass(
    ws: &WorkingSet,
    bounds: (usize, usize),
    config: &Config,
    pool: &mut Pool,
    freed_bytes: &AtomicUsize,
) {
    let n = ws.len();
    let workers = worker_count(n, config).min(pool.thread_count() as usize);

    if workers == 1 {
        sweep_range(ws, 0, n, bounds, config, freed_bytes);
        return;
    }

    let per_worker = n / workers;
    pool.scoped(|scope| {
        for w in 0..workers {
            let begin = w * per_worker;
            let end = if w + 1 == workers { n } else { begin + per_worker };
            scope.execute(move || sweep_range(ws, begin, end, bounds, config, freed_bytes));
        }
    });
}

/// Claim and free every provisional garbage root in `[begin, end)`.
fn sweep_range(
    ws: &WorkingSet,
    begin: usize,
    end: usize,
    bounds: (usize, usize),
    config: &Config,
    freed_bytes: &AtomicUsize,
) {
    for i in begin..end {
        let slot = ws.slot(i);
        debug_assert!(slot.raw() != 0);
        if !slot.is_claimed() && ws.refs(i).load(Ordering::Acquire) == 0 && slot.claim() {
            unref(ws, i, bounds, config.max_unref_depth, freed_bytes);
        }
    }
}

/// Release claimed candidate `i`: walk its body, retract every reference
/// it holds into the candidate set, recurse into anything that drops to
/// zero while depth permits (deeper chains are finished by later passes),
/// then hand the block back to the allocator.
fn unref(
    ws: &WorkingSet,
    i: usize,
    bounds: (usize, usize),
    depth: usize,
    freed_bytes: &AtomicUsize,
) {
    debug_assert!(ws.slot(i).is_claimed());
    let addr = ws.addr(i);
    let size = ws.alloc_size(i);
    let body = addr as *mut usize;
    let words = size / WORD_SIZE;
    let n = ws.len();

    for k in 0..words {
        let word = unsafe { body.add(k).read() };
        let target = tagged::mask(word);
        if target < bounds.0 || target > bounds.1 {
            continue;
        }
        // Dead memory: null the slot so nothing can mis-scan it later.
        unsafe {
            body.add(k).write(0);
        }
        let loc = if target < addr {
            unsafe { sort::lower_bound(ws.addrs_ptr(), 0, i, target) }
        } else {
            unsafe { sort::lower_bound(ws.addrs_ptr(), i, n, target) }
        };
        if loc == i {
            // A block whose body holds its own address; its self-count
            // kept it out of the root set, so never retract it here.
            continue;
        }
        if unsafe { sort::is_ref(ws.addrs_ptr(), n, loc, target) } {
            let remaining = ws.refs(loc).fetch_sub(1, Ordering::AcqRel) - 1;
            debug_assert!(remaining >= 0);
            if depth > 0 && remaining == 0 && ws.slot(loc).claim() {
                unref(ws, loc, bounds, depth - 1, freed_bytes);
            }
        }
    }

    freed_bytes.fetch_add(size, Ordering::Relaxed);
    unsafe {
        mem::release(addr);
    }
}

/// Drop claimed entries, sliding survivors (and their parallel counts)
/// down to keep the array dense and sorted. Returns the number of entries
/// dropped. Single-threaded: runs between passes.
fn compact(ws: &WorkingSet) -> usize {
    let n = ws.len();
    let mut write = 0;
    for i in 0..n {
        if ws.slot(i).is_claimed() {
            continue;
        }
        if write != i {
            ws.copy_entry(i, write);
        }
        write += 1;
    }
    ws.set_len(write);
    n - write
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchChain, RetiredBatch};
    use crate::working_set::WorkingSet;

    fn chain_of(addrs: &[usize]) -> BatchChain {
        let mut batch = RetiredBatch::new(addrs.len());
        for &a in addrs {
            assert!(batch.push(a));
        }
        let mut chain = BatchChain::new();
        chain.push(batch);
        chain
    }

    /// Build an aggregated working set over freshly calloc'd blocks and
    /// apply the scan's counting rule by hand: one increment per root
    /// reference plus one per candidate-body reference.
    fn scanned_set(addrs: &[usize], roots: &[usize]) -> WorkingSet {
        let mut ws = WorkingSet::with_capacity(addrs.len());
        ws.aggregate(&chain_of(addrs), &Config::default());
        for i in 0..ws.len() {
            let base = ws.addr(i) as *const usize;
            for k in 0..ws.alloc_size(i) / WORD_SIZE {
                let word = tagged::mask(unsafe { base.add(k).read() });
                if let Some(loc) = ws.lookup(word) {
                    ws.refs(loc).fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        for &root in roots {
            if let Some(loc) = ws.lookup(root) {
                ws.refs(loc).fetch_add(1, Ordering::Relaxed);
            }
        }
        ws
    }

    #[test]
    fn single_unreferenced_block_is_freed() {
        unsafe {
            let p = libc::calloc(1, 64) as usize;
            let ws = scanned_set(&[p], &[]);
            let outcome = sweep(&ws, &Config::default());
            assert_eq!(outcome.freed, 1);
            assert_eq!(outcome.survivors, 0);
            assert!(outcome.freed_bytes >= 64);
        }
    }

    #[test]
    fn rooted_block_survives() {
        unsafe {
            let p = libc::calloc(1, 64) as usize;
            let ws = scanned_set(&[p], &[p]);
            let outcome = sweep(&ws, &Config::default());
            assert_eq!(outcome.freed, 0);
            assert_eq!(outcome.survivors, 1);
            assert_eq!(ws.addr(0), p);
            libc::free(p as *mut _);
        }
    }

    #[test]
    fn unrooted_pair_chain_freed_in_one_pass() {
        unsafe {
            // head -> tail, nothing references head.
            let head = libc::calloc(1, 32) as usize;
            let tail = libc::calloc(1, 32) as usize;
            (head as *mut usize).write(tail);

            let ws = scanned_set(&[head, tail], &[]);
            let loc_tail = ws.lookup(tail).unwrap();
            assert_eq!(ws.refs(loc_tail).load(Ordering::Relaxed), 1);

            let outcome = sweep(&ws, &Config::default());
            assert_eq!(outcome.freed, 2);
            assert_eq!(outcome.survivors, 0);
            assert_eq!(outcome.passes, 1);
        }
    }

    #[test]
    fn dead_two_cycle_is_carried_forward() {
        unsafe {
            // A and B point at each other; no root references either. Each
            // keeps the other's count at one, so no sweep root exists and
            // both ride the carry-forward list.
            let a = libc::calloc(1, 32) as usize;
            let b = libc::calloc(1, 32) as usize;
            (a as *mut usize).write(b);
            (b as *mut usize).write(a);

            let ws = scanned_set(&[a, b], &[]);
            let outcome = sweep(&ws, &Config::default());
            assert_eq!(outcome.freed, 0);
            assert_eq!(outcome.survivors, 2);
            assert_eq!(outcome.passes, 1);

            libc::free(a as *mut _);
            libc::free(b as *mut _);
        }
    }

    #[test]
    fn chain_longer_than_depth_cap_takes_two_passes() {
        unsafe {
            // Chain the blocks against address order so the depth-capped
            // remainder lands behind the sweep cursor and a second pass is
            // required: ceil(50 / 30) passes, everything freed.
            let mut blocks: Vec<usize> = (0..50).map(|_| libc::calloc(1, 32) as usize).collect();
            blocks.sort_unstable_by(|a, b| b.cmp(a));
            for w in blocks.windows(2) {
                (w[0] as *mut usize).write(w[1]);
            }

            let ws = scanned_set(&blocks, &[]);
            let config = Config::default();
            assert_eq!(config.max_unref_depth, 30);

            let outcome = sweep(&ws, &config);
            assert_eq!(outcome.freed, 50);
            assert_eq!(outcome.survivors, 0);
            assert_eq!(outcome.passes, 2);
        }
    }

    #[test]
    fn self_referential_block_survives() {
        unsafe {
            let p = libc::calloc(1, 32) as usize;
            (p as *mut usize).write(p);

            let ws = scanned_set(&[p], &[]);
            assert_eq!(ws.refs(0).load(Ordering::Relaxed), 1);

            let outcome = sweep(&ws, &Config::default());
            assert_eq!(outcome.freed, 0);
            assert_eq!(outcome.survivors, 1);

            libc::free(p as *mut _);
        }
    }

    #[test]
    fn duplicate_retirement_frees_once() {
        unsafe {
            let p = libc::calloc(1, 64) as usize;
            let mut ws = WorkingSet::with_capacity(2);
            ws.aggregate(&chain_of(&[p, p]), &Config::default());
            assert_eq!(ws.len(), 1);
            assert_eq!(ws.duplicates(), 1);

            let outcome = sweep(&ws, &Config::default());
            assert_eq!(outcome.freed, 1);
            assert_eq!(outcome.survivors, 0);
        }
    }

    #[test]
    fn one_worker_per_full_shard() {
        let config = Config::default();
        assert_eq!(worker_count(1, &config), 1);
        assert_eq!(worker_count(config.addrs_per_worker, &config), 1);
        assert_eq!(worker_count(config.addrs_per_worker + 1, &config), 2);
        assert_eq!(worker_count(usize::MAX / 2, &config), config.max_workers);
    }
}
