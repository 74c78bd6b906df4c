//! Per-mutator descriptors and the live-thread registry.
//!
//! Every thread that retires pointers registers a descriptor carrying its
//! stack span and retire buffer. Descriptors are reference-counted by hand:
//! the owning thread holds one reference from registration to exit, and the
//! collector pins descriptors for the duration of a snapshot. Final release
//! happens only once the count reaches zero *and* the owner has exited;
//! the staged-free step treats a nonzero count at that point as a data
//! race and aborts.

use std::cell::{Cell, UnsafeCell};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::batch::RetiredBatch;
use crate::util::fatal;

pub struct ThreadData {
    pub(crate) stack_low: usize,
    pub(crate) stack_high: usize,
    /// Stack pointer recorded by the safepoint handler; the child scans
    /// `[saved_sp, stack_high)`.
    pub(crate) saved_sp: AtomicUsize,
    pub(crate) tid: libc::pthread_t,
    ref_count: AtomicI32,
    exited: AtomicBool,
    pub(crate) retire_buffer: UnsafeCell<Option<Box<RetiredBatch>>>,
    next: *mut ThreadData,
}

/// Mutex-guarded intrusive list of live mutator descriptors.
///
/// The coordinator holds the guard across the whole park window (signal →
/// acks → fork → release), so membership cannot change between counting
/// the mutators and freezing their stacks.
pub struct ThreadList {
    head: UnsafeCell<*mut ThreadData>,
    lock: Mutex<usize>,
}

unsafe impl Send for ThreadList {}
unsafe impl Sync for ThreadList {}

impl ThreadList {
    pub const fn new() -> ThreadList {
        ThreadList {
            head: UnsafeCell::new(null_mut()),
            lock: Mutex::new(0),
        }
    }

    pub(crate) fn park_lock(&self) -> MutexGuard<'_, usize> {
        self.lock.lock()
    }

    fn add(&self, td: *mut ThreadData) {
        let mut count = self.lock.lock();
        unsafe {
            (*td).next = *self.head.get();
            *self.head.get() = td;
        }
        *count += 1;
    }

    fn remove(&self, td: *mut ThreadData) {
        let mut count = self.lock.lock();
        unsafe {
            let head = self.head.get();
            if *head == td {
                *head = (*td).next;
            } else {
                let mut cur = *head;
                while !cur.is_null() && (*cur).next != td {
                    cur = (*cur).next;
                }
                if cur.is_null() {
                    fatal!("unregistering a thread that was never registered");
                }
                (*cur).next = (*td).next;
            }
        }
        debug_assert!(*count > 0);
        *count -= 1;
    }

    /// Walk the list without taking the lock.
    ///
    /// # Safety
    ///
    /// The caller must either hold the park lock or be the forked child,
    /// whose image of the list is frozen.
    pub(crate) unsafe fn iter_unlocked(&self, mut f: impl FnMut(&ThreadData)) {
        let mut cur = *self.head.get();
        while !cur.is_null() {
            f(&*cur);
            cur = (*cur).next;
        }
    }

    /// Pin every descriptor so teardown cannot race the scan. Caller holds
    /// the park lock.
    pub(crate) fn pin_all_locked(&self) -> PinnedThreads {
        let mut pinned = Vec::new();
        unsafe {
            let mut cur = *self.head.get();
            while !cur.is_null() {
                (*cur).ref_count.fetch_add(1, Ordering::AcqRel);
                pinned.push(cur);
                cur = (*cur).next;
            }
        }
        PinnedThreads(pinned)
    }
}

pub(crate) struct PinnedThreads(Vec<*mut ThreadData>);

unsafe impl Send for PinnedThreads {}

impl PinnedThreads {
    pub fn release(self) {
        for td in self.0 {
            decr_ref(td);
        }
    }
}

pub(crate) static REGISTRY: ThreadList = ThreadList::new();

struct StagedFree(Mutex<Vec<*mut ThreadData>>);

unsafe impl Send for StagedFree {}
unsafe impl Sync for StagedFree {}

static STAGED: StagedFree = StagedFree(Mutex::new(Vec::new()));

fn decr_ref(td: *mut ThreadData) {
    let remaining = unsafe { (*td).ref_count.fetch_sub(1, Ordering::AcqRel) - 1 };
    debug_assert!(remaining >= 0);
    if remaining == 0 {
        STAGED.0.lock().push(td);
        drain_staged();
    }
}

fn drain_staged() {
    loop {
        let td = match STAGED.0.lock().pop() {
            Some(td) => td,
            None => return,
        };
        unsafe {
            if (*td).ref_count.load(Ordering::Acquire) != 0 {
                fatal!("detected data race on exiting thread");
            }
            debug_assert!((*td).exited.load(Ordering::Acquire));
            drop(Box::from_raw(td));
        }
    }
}

thread_local! {
    static CURRENT: Cell<*mut ThreadData> = const { Cell::new(null_mut()) };
}

/// The calling thread's descriptor, or null before registration. Read by
/// the safepoint handler; const-initialized TLS so the access is
/// async-signal-safe.
pub(crate) fn current() -> *mut ThreadData {
    CURRENT.with(|c| c.get())
}

/// Register the calling thread as a mutator with the given stack span.
/// Must precede any `retire` call on this thread.
pub fn register_thread(stack_low: usize, stack_high: usize) {
    if !current().is_null() {
        return;
    }
    let td = Box::into_raw(Box::new(ThreadData {
        stack_low,
        stack_high,
        saved_sp: AtomicUsize::new(0),
        tid: unsafe { libc::pthread_self() },
        ref_count: AtomicI32::new(1),
        exited: AtomicBool::new(false),
        retire_buffer: UnsafeCell::new(None),
        next: null_mut(),
    }));
    CURRENT.with(|c| c.set(td));
    REGISTRY.add(td);
}

/// Register the calling thread, deriving its stack span from the pthread
/// attributes.
pub fn register_current_thread() {
    let (low, high) = current_stack_bounds();
    register_thread(low, high);
}

/// Tear down the calling thread's descriptor. Any pointers still sitting
/// in its retire buffer are submitted first rather than leaked.
pub fn unregister_thread() {
    let td = current();
    if td.is_null() {
        return;
    }
    CURRENT.with(|c| c.set(null_mut()));

    let pending = unsafe { (*(*td).retire_buffer.get()).take() };
    if let Some(batch) = pending {
        if !batch.is_empty() {
            if let Some(collector) = crate::collector::instance() {
                collector.submit(batch);
            }
        }
    }

    REGISTRY.remove(td);
    unsafe {
        (*td).exited.store(true, Ordering::Release);
    }
    decr_ref(td);
}

pub(crate) fn current_stack_bounds() -> (usize, usize) {
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            fatal!("pthread_getattr_np failed");
        }
        let mut stack_addr: *mut libc::c_void = null_mut();
        let mut stack_size: libc::size_t = 0;
        if libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size) != 0 {
            fatal!("pthread_attr_getstack failed");
        }
        libc::pthread_attr_destroy(&mut attr);
        (stack_addr as usize, stack_addr as usize + stack_size)
    }
}

static ROOT_REGIONS: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

/// Register an extra conservative root region (a data segment, an arena of
/// long-lived handles). Scanned in every subsequent cycle.
pub fn register_root_region(low: usize, high: usize) {
    debug_assert!(low <= high);
    ROOT_REGIONS.lock().push((low, high));
}

/// Snapshot of the registered root regions. Taken by the coordinator
/// *before* the park window: a mutator parked inside
/// `register_root_region` may hold the region lock, so neither the
/// coordinator nor the child may touch it afterwards.
pub(crate) fn root_regions() -> Vec<(usize, usize)> {
    ROOT_REGIONS.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_bounds_contain_a_local() {
        let local = 0usize;
        let (low, high) = current_stack_bounds();
        let here = &local as *const usize as usize;
        assert!(low < high);
        assert!(here >= low && here < high);
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let list = ThreadList::new();
        let td = Box::into_raw(Box::new(ThreadData {
            stack_low: 0,
            stack_high: 4096,
            saved_sp: AtomicUsize::new(0),
            tid: unsafe { libc::pthread_self() },
            ref_count: AtomicI32::new(1),
            exited: AtomicBool::new(false),
            retire_buffer: UnsafeCell::new(None),
            next: null_mut(),
        }));
        list.add(td);
        assert_eq!(*list.park_lock(), 1);

        let mut seen = 0;
        unsafe {
            list.iter_unlocked(|_| seen += 1);
        }
        assert_eq!(seen, 1);

        list.remove(td);
        assert_eq!(*list.park_lock(), 0);
        unsafe {
            drop(Box::from_raw(td));
        }
    }
}
