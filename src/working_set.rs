//! The shared, sorted candidate arrays built for one cycle.
//!
//! One page-aligned shared mapping holds a header page followed by four
//! parallel arrays: candidate addresses (tagged slots), the minimap, the
//! reference counts, and the allocation sizes. The parent sizes and maps
//! it before the snapshot; the child fills, sorts and scans it; the parent
//! sweeps it. The header lives inside the mapping because the child must
//! publish the post-collapse entry count to the parent across the fork
//! boundary.

use std::sync::atomic::AtomicI32;

use crate::batch::BatchChain;
use crate::config::Config;
use crate::mem::{self, SharedMmap};
use crate::sort;
use crate::tagged::{self, TaggedSlot};
use crate::util::{as_atomic_i32, fatal, page_size, pages_for, WORD_SIZE};

#[repr(C)]
struct Header {
    n_addrs: usize,
    n_minimap: usize,
    n_duplicates: usize,
}

pub(crate) struct WorkingSet {
    map: SharedMmap,
    hdr: *mut Header,
    addrs: *mut usize,
    minimap: *mut usize,
    refs: *mut i32,
    alloc_sz: *mut u32,
    capacity: usize,
}

unsafe impl Send for WorkingSet {}
unsafe impl Sync for WorkingSet {}

impl WorkingSet {
    /// Map a working set sized for `capacity` candidates. Every array gets
    /// whole pages so the sections stay page-aligned.
    pub fn with_capacity(capacity: usize) -> WorkingSet {
        assert!(capacity > 0);
        let page = page_size();
        let pages_of_addrs = pages_for(capacity * WORD_SIZE);
        let pages_of_minimap = pages_for(pages_of_addrs * WORD_SIZE);
        let pages_of_count = pages_for(capacity * core::mem::size_of::<i32>());
        let total =
            (1 + pages_of_addrs + pages_of_minimap + 2 * pages_of_count) * page;

        let map = SharedMmap::new(total);
        let base = map.start();
        unsafe {
            let mut offset = page;
            let hdr = base as *mut Header;
            let addrs = base.add(offset) as *mut usize;
            offset += pages_of_addrs * page;
            let minimap = base.add(offset) as *mut usize;
            offset += pages_of_minimap * page;
            let refs = base.add(offset) as *mut i32;
            offset += pages_of_count * page;
            let alloc_sz = base.add(offset) as *mut u32;

            WorkingSet {
                map,
                hdr,
                addrs,
                minimap,
                refs,
                alloc_sz,
                capacity,
            }
        }
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.hdr).n_addrs }
    }

    pub(crate) fn set_len(&self, n: usize) {
        unsafe {
            (*self.hdr).n_addrs = n;
        }
    }

    pub fn duplicates(&self) -> usize {
        unsafe { (*self.hdr).n_duplicates }
    }

    pub fn slot(&self, i: usize) -> &TaggedSlot {
        debug_assert!(i < self.capacity);
        unsafe { TaggedSlot::from_ptr(self.addrs.add(i)) }
    }

    pub fn addr(&self, i: usize) -> usize {
        self.slot(i).address()
    }

    pub fn refs(&self, i: usize) -> &AtomicI32 {
        debug_assert!(i < self.capacity);
        unsafe { as_atomic_i32(self.refs.add(i)) }
    }

    pub fn alloc_size(&self, i: usize) -> usize {
        debug_assert!(i < self.capacity);
        unsafe { self.alloc_sz.add(i).read() as usize }
    }

    pub(crate) fn addrs_ptr(&self) -> *const usize {
        self.addrs
    }

    /// Smallest and largest candidate address. Valid only while non-empty.
    pub fn bounds(&self) -> (usize, usize) {
        debug_assert!(self.len() > 0);
        (self.addr(0), self.addr(self.len() - 1))
    }

    /// Fill, sort, collapse, size and index the candidate set. Runs in the
    /// child, single-threaded, before the conservative scan.
    pub fn aggregate(&mut self, input: &BatchChain, config: &Config) {
        let addrs = self.addrs;
        let capacity = self.capacity;
        let mut n = 0usize;
        input.for_each_addr(|a| {
            debug_assert!(n < capacity);
            debug_assert!(a != 0 && a & tagged::DEAD_BIT == 0);
            unsafe {
                addrs.add(n).write(a);
            }
            n += 1;
        });
        debug_assert!(n > 0);

        let slice = unsafe { core::slice::from_raw_parts_mut(self.addrs, n) };
        sort::sort(slice, config.sort_threshold);

        // Collapse duplicate retirements: the lower-bound lookup pins every
        // hit on the first entry of a run, so a preserved duplicate would
        // be freed a second time.
        let duplicates = collapse_duplicates(slice);
        n -= duplicates;
        self.assert_monotonic(n);

        unsafe {
            (*self.hdr).n_addrs = n;
            (*self.hdr).n_duplicates = duplicates;
        }

        self.query_alloc_sizes();
        self.build_minimap();
    }

    fn query_alloc_sizes(&self) {
        for i in 0..self.len() {
            let addr = self.addr(i);
            let size = mem::usable_size(addr);
            if size == 0 {
                fatal!("allocator reports zero size for retired pointer {:#x}", addr);
            }
            unsafe {
                self.alloc_sz.add(i).write(size as u32);
            }
        }
    }

    /// One minimap entry per page of `addrs[]`: a sparse first-level index
    /// that bounds the binary search to a single page on cold scans.
    fn build_minimap(&self) {
        let stride = page_size() / WORD_SIZE;
        let n = self.len();
        let mut k = 0;
        let mut i = 0;
        while i < n {
            unsafe {
                self.minimap.add(k).write(self.addrs.add(i).read());
            }
            k += 1;
            i += stride;
        }
        unsafe {
            (*self.hdr).n_minimap = k;
        }
    }

    /// Bracket the binary-search range for `key` using the minimap. The
    /// caller has already rejected keys outside [`Self::bounds`].
    fn bracket(&self, key: usize) -> (usize, usize) {
        let n_minimap = unsafe { (*self.hdr).n_minimap };
        let stride = page_size() / WORD_SIZE;
        let lb = unsafe { sort::lower_bound(self.minimap, 0, n_minimap, key) };
        let k = if lb < n_minimap && unsafe { self.minimap.add(lb).read() } == key {
            lb
        } else {
            lb.saturating_sub(1)
        };
        let lo = k * stride;
        let hi = ((k + 1) * stride).min(self.len());
        (lo, hi)
    }

    /// Find `word` in the candidate set. Masks the dead bit, quick-rejects
    /// outside the candidate range, then binary-searches one minimap page.
    pub fn lookup(&self, word: usize) -> Option<usize> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        let key = tagged::mask(word);
        let (min, max) = self.bounds();
        if key < min || key > max {
            return None;
        }
        let (lo, hi) = self.bracket(key);
        let loc = unsafe { sort::lower_bound(self.addrs, lo, hi, key) };
        if unsafe { sort::is_ref(self.addrs, n, loc, key) } {
            Some(loc)
        } else {
            None
        }
    }

    /// Move entry `src` into slot `dst` during compaction. Single-threaded:
    /// runs between sweep passes.
    pub(crate) fn copy_entry(&self, src: usize, dst: usize) {
        unsafe {
            self.addrs.add(dst).write(self.addrs.add(src).read());
            self.refs.add(dst).write(self.refs.add(src).read());
            self.alloc_sz.add(dst).write(self.alloc_sz.add(src).read());
        }
    }

    fn assert_monotonic(&self, n: usize) {
        if cfg!(debug_assertions) {
            let mut last = 0usize;
            for i in 0..n {
                let a = unsafe { self.addrs.add(i).read() };
                if a <= last {
                    fatal!(
                        "addrs[] not monotonic at {} of {} ({:#x}, last {:#x})",
                        i,
                        n,
                        a,
                        last
                    );
                }
                last = a;
            }
        }
    }
}

/// Collapse runs of equal keys in a sorted slice, returning the savings.
fn collapse_duplicates(a: &mut [usize]) -> usize {
    if a.len() < 2 {
        return 0;
    }
    let mut write = 0;
    for search in 1..a.len() {
        if a[search] == a[write] {
            continue;
        }
        write += 1;
        if write < search {
            a[write] = a[search];
        }
    }
    a.len() - (write + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchChain, RetiredBatch};
    use std::sync::atomic::Ordering;

    fn chain_of(addrs: &[usize]) -> BatchChain {
        let mut batch = RetiredBatch::new(addrs.len());
        for &a in addrs {
            assert!(batch.push(a));
        }
        let mut chain = BatchChain::new();
        chain.push(batch);
        chain
    }

    #[test]
    fn collapse_leaves_unique_keys() {
        let mut a = vec![8usize, 8, 16, 24, 24, 24];
        let savings = collapse_duplicates(&mut a);
        assert_eq!(savings, 3);
        assert_eq!(&a[..3], &[8, 16, 24]);
    }

    #[test]
    fn aggregate_sorts_collapses_and_sizes() {
        unsafe {
            let a = libc::malloc(24) as usize;
            let b = libc::malloc(64) as usize;
            let c = libc::malloc(128) as usize;

            let mut ws = WorkingSet::with_capacity(4);
            ws.aggregate(&chain_of(&[c, a, b, a]), &Config::default());

            assert_eq!(ws.len(), 3);
            assert_eq!(ws.duplicates(), 1);
            assert!(ws.addr(0) < ws.addr(1) && ws.addr(1) < ws.addr(2));
            for i in 0..3 {
                assert!(ws.alloc_size(i) >= 24);
                assert_eq!(ws.refs(i).load(Ordering::Relaxed), 0);
            }

            assert!(ws.lookup(a).is_some());
            assert!(ws.lookup(b).is_some());
            assert!(ws.lookup(c | 1).is_some());
            assert_eq!(ws.lookup(a + WORD_SIZE), None);
            assert_eq!(ws.lookup(0x10), None);

            drop(ws);
            libc::free(a as *mut _);
            libc::free(b as *mut _);
            libc::free(c as *mut _);
        }
    }

    #[test]
    fn lookup_covers_many_candidates() {
        unsafe {
            let blocks: Vec<usize> = (0..1000).map(|_| libc::malloc(16) as usize).collect();
            let mut ws = WorkingSet::with_capacity(blocks.len());
            ws.aggregate(&chain_of(&blocks), &Config::default());

            assert_eq!(ws.len(), blocks.len());
            for &b in &blocks {
                let loc = ws.lookup(b).unwrap();
                assert_eq!(ws.addr(loc), b);
            }

            drop(ws);
            for b in blocks {
                libc::free(b as *mut _);
            }
        }
    }
}
