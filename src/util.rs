use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Print a diagnostic and terminate the process. Nothing inside a
/// reclamation cycle is recoverable: mutators may be parked at the
/// safepoint and the working set half-consumed.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("fission fatal: {}", format_args!($($arg)*));
        std::process::abort()
    }};
}

pub(crate) use fatal;

pub fn page_size() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    CACHED.store(size, Ordering::Relaxed);
    size
}

/// Number of whole pages needed to hold `bytes`.
pub fn pages_for(bytes: usize) -> usize {
    let page = page_size();
    (bytes + page - 1) / page
}

/// View a plain word as its atomic counterpart.
///
/// The working-set arrays are filled single-threaded during aggregation
/// and then updated concurrently by scan and sweep workers; this is the
/// bridge between the two phases.
pub unsafe fn as_atomic_usize<'a>(p: *const usize) -> &'a AtomicUsize {
    &*(p as *const AtomicUsize)
}

pub unsafe fn as_atomic_i32<'a>(p: *const i32) -> &'a AtomicI32 {
    &*(p as *const AtomicI32)
}
