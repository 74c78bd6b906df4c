//! Bringing every mutator to a known safepoint for the snapshot.
//!
//! The coordinator raises a signal against every registered mutator and
//! waits for all of them to acknowledge. Each handler spills its register
//! file onto its own stack, records its stack pointer, acknowledges, and
//! spins until the coordinator (having forked) advances the release
//! counter. The two counters share nothing else, so they get their own
//! cache lines.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::context::{approximate_stack_pointer, save_context, RegisterSet};
use crate::thread_data::{self, ThreadList};
use crate::util::fatal;

/// The signal used to park mutators. Collaborating allocator shims defer
/// it (see [`DeferSafepoint`]) so no thread is ever parked while holding
/// an allocator lock, which would deadlock the snapshot fork.
pub const SAFEPOINT_SIGNAL: libc::c_int = libc::SIGUSR1;

static ACKS: CachePadded<AtomicUsize> = CachePadded::new(AtomicUsize::new(0));
static RELEASE: CachePadded<AtomicUsize> = CachePadded::new(AtomicUsize::new(0));

extern "C" fn on_safepoint_signal(_sig: libc::c_int) {
    wait_for_snapshot();
}

pub(crate) fn install_handler() {
    unsafe {
        let handler: extern "C" fn(libc::c_int) = on_safepoint_signal;
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(SAFEPOINT_SIGNAL, &sa, core::ptr::null_mut()) != 0 {
            fatal!("unable to install the safepoint signal handler");
        }
    }
}

/// Mutator side of the park protocol. Runs in the signal handler, on the
/// interrupted thread's own stack; everything here is async-signal-safe.
pub fn wait_for_snapshot() {
    let mut regs = RegisterSet::zeroed();
    save_context(&mut regs);

    let td = thread_data::current();
    if !td.is_null() {
        unsafe {
            (*td)
                .saved_sp
                .store(approximate_stack_pointer(), Ordering::Relaxed);
        }
    }

    // The ticket must be read before the acknowledgement: once the
    // coordinator has seen all acks it may release at any moment.
    let ticket = RELEASE.load(Ordering::Acquire);
    ACKS.fetch_add(1, Ordering::Release);
    while RELEASE.load(Ordering::Acquire) == ticket {
        unsafe {
            libc::sched_yield();
        }
    }

    // The spill buffer must survive on the stack until the snapshot has
    // been taken.
    std::hint::black_box(&regs);
}

/// Reset the acknowledgement counter for a new park window.
pub(crate) fn begin_park() {
    ACKS.store(0, Ordering::SeqCst);
}

/// Raise the safepoint signal against every registered mutator. The caller
/// holds the park lock, so the set cannot change underneath us.
pub(crate) fn signal_mutators(registry: &ThreadList) -> usize {
    let mut signalled = 0;
    unsafe {
        registry.iter_unlocked(|td| {
            if libc::pthread_kill(td.tid, SAFEPOINT_SIGNAL) != 0 {
                fatal!("unable to signal a registered mutator");
            }
            signalled += 1;
        });
    }
    signalled
}

/// Poll until all `expected` mutators are parked.
pub(crate) fn wait_for_acks(expected: usize) {
    while ACKS.load(Ordering::Acquire) < expected {
        unsafe {
            libc::sched_yield();
        }
    }
}

/// Advance the release counter, resuming every parked mutator.
pub(crate) fn release_mutators() {
    RELEASE.fetch_add(1, Ordering::Release);
}

/// Masks [`SAFEPOINT_SIGNAL`] for the calling thread while alive, so the
/// thread cannot be parked in the middle of a critical section it shares
/// with the child scanner (above all: the allocator). The signal is
/// delivered, and the thread parks, as soon as the guard drops.
pub struct DeferSafepoint {
    old: libc::sigset_t,
}

impl DeferSafepoint {
    pub fn new() -> DeferSafepoint {
        unsafe {
            let mut set: libc::sigset_t = core::mem::zeroed();
            let mut old: libc::sigset_t = core::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, SAFEPOINT_SIGNAL);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
            DeferSafepoint { old }
        }
    }
}

impl Default for DeferSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferSafepoint {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, core::ptr::null_mut());
        }
    }
}
