//! Type-erased work items for the thread pool

use std::cell::UnsafeCell;

/// Closure that can be handed to a pool worker.
pub(crate) trait Work: FnOnce() + Send {}
//
impl<Body: FnOnce() + Send> Work for Body {}

/// [`Work`] that has been prepared for submission to the thread pool
///
/// # Safety
///
/// Safe use of [`Job`] requires carefully following this procedure:
///
/// - Create the [`Job`] on a stack frame that outlives its execution.
/// - Create a type-erased handle with `as_dyn()` and submit it to the pool.
/// - Until the completion signal (for parallel regions, the region latch) has
///   been observed, do not exit that stack frame or interact with the job in
///   any way, including moving or dropping it.
pub(crate) struct Job<ImplWork: Work>(UnsafeCell<Option<ImplWork>>);
//
impl<ImplWork: Work> Job<ImplWork> {
    /// Prepare a closure for submission to the thread pool
    pub fn new(work: ImplWork) -> Self {
        Self(UnsafeCell::new(Some(work)))
    }

    /// Create a type-erased handle that can be pushed on a work queue
    ///
    /// # Safety
    ///
    /// Should only be called once, as preparation for submitting the job to
    /// the thread pool.
    pub unsafe fn as_dyn(&mut self) -> DynJob {
        let state = self.0.get().cast::<()>();
        let run = |state: *mut ()| {
            let state = state.cast::<Option<ImplWork>>();
            // SAFETY: Per the `Job` API contract, the state outlives the
            //         handle and only one handle ever exists, so the worker
            //         holds the only live pointer to it.
            let work = unsafe { (*state).take() };
            if let Some(work) = work {
                work();
            }
        };
        DynJob { state, run }
    }
}

/// Type-erased handle to a [`Job`], or a wake-up carrying no work
pub(crate) struct DynJob {
    /// Type-erased `&mut Option<ImplWork>` pointer, null for no-op handles
    state: *mut (),

    /// Type-erased routine that takes and runs the closure behind `state`
    run: fn(*mut ()),
}
//
impl DynJob {
    /// Handle that does nothing when run
    ///
    /// Used to wake an idle worker so that it re-checks the overflow queue
    /// before going back to sleep.
    pub fn noop() -> Self {
        Self {
            state: std::ptr::null_mut(),
            run: |_| {},
        }
    }

    /// Execute the job
    ///
    /// # Safety
    ///
    /// See top-level [`Job`] documentation.
    pub unsafe fn run(self) {
        (self.run)(self.state)
    }
}
//
// SAFETY: It is safe to send a DynJob to another thread because the inner
//         closure is Send and the Job API contract ensures that the
//         submitting thread will not touch the backing storage until the
//         completion signal, so the worker effectively owns the closure.
unsafe impl Send for DynJob {}
