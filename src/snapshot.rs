//! Process clone as a snapshot.
//!
//! Once every mutator is parked, forking the process yields a frozen
//! copy-on-write image of all stacks and heap memory at effectively
//! constant cost to mutators. The child scans the image at leisure while
//! the parent releases the mutators and waits for the scan report on a
//! pipe that was opened before anyone was signalled.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::safepoint;
use crate::thread_data::ThreadList;
use crate::util::{fatal, WORD_SIZE};

/// Child's write end of the report pipe.
pub(crate) struct ScanPipe {
    fd: libc::c_int,
}

impl ScanPipe {
    /// Report the number of bytes scanned back to the parent, as a single
    /// word.
    pub fn send_report(&self, bytes_scanned: usize) {
        let n = unsafe {
            libc::write(
                self.fd,
                &bytes_scanned as *const usize as *const libc::c_void,
                WORD_SIZE,
            )
        };
        if n != WORD_SIZE as isize {
            fatal!("child failed to write the scan report");
        }
    }
}

impl Drop for ScanPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Parent's handle on an in-flight child scanner.
pub(crate) struct ChildScanner {
    pid: libc::pid_t,
    fd: libc::c_int,
}

impl ChildScanner {
    /// Block until the child's scan report arrives. A short read means the
    /// child died mid-scan; there is no recovering the cycle from that.
    pub fn recv_report(&self) -> usize {
        let mut bytes_scanned: usize = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut bytes_scanned as *mut usize as *mut libc::c_void,
                WORD_SIZE,
            )
        };
        if n != WORD_SIZE as isize {
            fatal!("failed to read from child");
        }
        bytes_scanned
    }

    /// Reap the exited child.
    pub fn reap(self) {
        unsafe {
            libc::waitpid(self.pid, core::ptr::null_mut(), 0);
        }
        OUTSTANDING_CHILD.store(0, Ordering::Release);
    }
}

impl Drop for ChildScanner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub(crate) enum Snapshot {
    Parent(ChildScanner),
    Child(ScanPipe),
}

static OUTSTANDING_CHILD: AtomicI32 = AtomicI32::new(0);

/// Park every mutator, fork, release. Returns on both sides of the fork.
///
/// The park lock is held from the first signal until after the release so
/// registration and teardown cannot race the park set; descriptors are
/// additionally pinned across the window. On fork failure the cycle is
/// fatal: mutators are parked and there is no consistent state to resume
/// into.
pub(crate) fn take(registry: &ThreadList) -> Snapshot {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        fatal!("unable to open a pipe for the child scanner");
    }

    let guard = registry.park_lock();
    safepoint::begin_park();
    let mutators = safepoint::signal_mutators(registry);
    safepoint::wait_for_acks(mutators);
    let pinned = registry.pin_all_locked();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        fatal!("collection failed (fork)");
    }

    if pid == 0 {
        // The park lock and the pins belong to the parent's collector
        // thread, which does not exist on this side of the fork.
        std::mem::forget(guard);
        std::mem::forget(pinned);
        unsafe {
            libc::close(fds[0]);
        }
        Snapshot::Child(ScanPipe { fd: fds[1] })
    } else {
        OUTSTANDING_CHILD.store(pid, Ordering::Release);
        safepoint::release_mutators();
        drop(guard);
        pinned.release();
        unsafe {
            libc::close(fds[1]);
        }
        Snapshot::Parent(ChildScanner { pid, fd: fds[0] })
    }
}

/// Kill and reap an outstanding child scanner, if any. Called on shutdown
/// so an exiting process never orphans a scanner.
pub(crate) fn kill_outstanding_child() {
    let pid = OUTSTANDING_CHILD.swap(0, Ordering::AcqRel);
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
            libc::waitpid(pid, core::ptr::null_mut(), 0);
        }
    }
}
