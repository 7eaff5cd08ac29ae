//! Worker-thread pool and loop schedulers for data-parallel loops
//!
//! `spindle` drives loops over a contiguous index range `[0, nwork)` across a
//! process-wide pool of long-lived worker threads. A loop is expressed as a
//! body that runs once per worker and pulls its share of the range through a
//! [`Scheduler`] handle, which keeps per-thread state trivially easy: it
//! lives in the body's own stack frame, across chunks.
//!
//! Three distribution policies cover the usual kernels: static block-cyclic
//! chunking ([`exec_static`]) for balanced work, dynamic self-scheduling
//! ([`exec_dynamic`]) for unpredictable work, and guided self-scheduling
//! ([`exec_guided`]) in between. [`exec_parallel`] replicates a body once per
//! worker and [`exec_single`] runs it serially behind the same interface.
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let data: Vec<u64> = (0..10_000).collect();
//! let sum = AtomicU64::new(0);
//! spindle::exec_static(data.len(), 0, 0, |sched: &mut dyn spindle::Scheduler| {
//!     while let Some(range) = sched.next_chunk() {
//!         let partial: u64 = range.into_iter().map(|i| data[i]).sum();
//!         sum.fetch_add(partial, Ordering::Relaxed);
//!     }
//! });
//! assert_eq!(sum.into_inner(), (0..10_000).sum());
//! ```
//!
//! A region fails atomically: if any body panics, exactly one panic resumes
//! on the calling thread once every worker has finished, and side effects of
//! the other workers are kept. Regions must not be started from inside a
//! body running on the pool; that can deadlock.
//!
//! Building with `--no-default-features` compiles the pool out entirely;
//! every driver then runs its body once on the calling thread behind a
//! scheduler reporting `num_threads() == 1`.

#![warn(clippy::print_stdout, clippy::print_stderr, clippy::dbg_macro)]

mod distribution;
#[cfg(feature = "threads")]
mod job;
#[cfg(feature = "threads")]
mod latch;
#[cfg(feature = "threads")]
mod pool;
mod range;

pub use distribution::{
    exec_dynamic, exec_guided, exec_parallel, exec_single, exec_static, Scheduler,
};
pub use range::Range;

#[cfg(feature = "threads")]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide default width for regions requested with `nthreads == 0`
///
/// Zero stands for "never set", which reads as [`max_threads`].
#[cfg(feature = "threads")]
static DEFAULT_NTHREADS: AtomicUsize = AtomicUsize::new(0);

/// Number of hardware threads, clamped to at least one
///
/// Constant for the lifetime of the process.
#[cfg(feature = "threads")]
pub fn max_threads() -> usize {
    use std::sync::OnceLock;
    static MAX_THREADS: OnceLock<usize> = OnceLock::new();
    *MAX_THREADS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    })
}

/// Number of hardware threads as far as this build is concerned: one
#[cfg(not(feature = "threads"))]
pub fn max_threads() -> usize {
    1
}

/// Region width used when a driver is called with `nthreads == 0`
///
/// Starts out as [`max_threads`] and can be changed process-wide with
/// [`set_default_nthreads`].
#[cfg(feature = "threads")]
pub fn get_default_nthreads() -> usize {
    match DEFAULT_NTHREADS.load(Ordering::Relaxed) {
        0 => max_threads(),
        nthreads => nthreads,
    }
}

/// Threading is compiled out, so the default width is one
#[cfg(not(feature = "threads"))]
pub fn get_default_nthreads() -> usize {
    1
}

/// Change the process-wide default region width, clamped to at least one
#[cfg(feature = "threads")]
pub fn set_default_nthreads(nthreads: usize) {
    DEFAULT_NTHREADS.store(nthreads.max(1), Ordering::Relaxed);
}

/// Threading is compiled out; the default width stays one
#[cfg(not(feature = "threads"))]
pub fn set_default_nthreads(_nthreads: usize) {}

/// Width of the region a driver was asked for: `0` means the process default
#[cfg(feature = "threads")]
pub(crate) fn resolve_nthreads(nthreads: usize) -> usize {
    if nthreads == 0 {
        get_default_nthreads()
    } else {
        nthreads
    }
}

/// Threading is compiled out: every region is one worker wide
#[cfg(not(feature = "threads"))]
pub(crate) fn resolve_nthreads(_nthreads: usize) -> usize {
    1
}
