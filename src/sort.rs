//! Sort and search over the candidate address array.
//!
//! The working set keys on raw addresses; everything downstream (minimap,
//! conservative scan, transitive decrement) assumes `addrs[]` is sorted
//! ascending. Searches mask the dead bit so they stay correct while sweep
//! workers claim entries concurrently.

use std::sync::atomic::Ordering;

use crate::tagged;
use crate::util::as_atomic_usize;

fn insertion_sort(addrs: &mut [usize], min: usize, max: usize) {
    for i in min + 1..=max {
        let mut j = i;
        while j > min && addrs[j - 1] > addrs[j] {
            addrs.swap(j - 1, j);
            j -= 1;
        }
    }
}

fn partition(addrs: &mut [usize], min: usize, max: usize) -> usize {
    let pivot = (max + min) / 2;
    let pivot_val = addrs[pivot];
    let mut mid = min;

    addrs.swap(pivot, max);
    for i in min..max {
        if addrs[i] <= pivot_val {
            addrs.swap(i, mid);
            mid += 1;
        }
    }
    addrs.swap(mid, max);
    mid
}

fn quicksort(addrs: &mut [usize], min: usize, max: usize, threshold: usize) {
    if max - min > threshold {
        let mid = partition(addrs, min, max);
        if mid > min {
            quicksort(addrs, min, mid - 1, threshold);
        }
        if mid < max {
            quicksort(addrs, mid + 1, max, threshold);
        }
    } else {
        insertion_sort(addrs, min, max);
    }
}

/// In-place ascending sort. Duplicate keys are preserved; the aggregation
/// step collapses them afterwards.
pub fn sort(addrs: &mut [usize], threshold: usize) {
    if addrs.len() > 1 {
        quicksort(addrs, 0, addrs.len() - 1, threshold);
    }
}

/// Lower bound of `key` in the sorted word array `[lo, hi)` starting at
/// `addrs`. Entries are loaded atomically and masked, so the search is
/// valid while sweep workers set dead bits. Returns an insertion point;
/// pair with [`is_ref`] to confirm a hit.
pub unsafe fn lower_bound(addrs: *const usize, mut lo: usize, mut hi: usize, key: usize) -> usize {
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let v = tagged::mask(as_atomic_usize(addrs.add(mid)).load(Ordering::Relaxed));
        if v < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// True iff `loc` (as returned by [`lower_bound`]) actually holds `key`.
pub unsafe fn is_ref(addrs: *const usize, n: usize, loc: usize, key: usize) -> bool {
    loc < n && tagged::mask(as_atomic_usize(addrs.add(loc)).load(Ordering::Relaxed)) == key
}
