//! Process-wide worker thread pool

use crate::job::DynJob;
use crate::max_threads;
use crossbeam::deque::{Injector, Steal};
use crossbeam::utils::CachePadded;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

/// Failure to bring up the worker threads of a [`ThreadPool`].
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// The OS refused to start a worker thread
    #[error("failed to spawn a worker thread")]
    Spawn(#[from] std::io::Error),
}

/// Fixed-size set of long-lived worker threads
///
/// Each worker owns a private handoff slot for one pending closure; work that
/// finds no idle worker at submit time goes to a shared overflow queue that
/// busy workers drain before going back to sleep.
pub(crate) struct ThreadPool {
    /// State shared with the worker threads
    shared: Arc<PoolShared>,

    /// Worker join handles, doubling as the pool's structural mutex: submit,
    /// shutdown and restart all serialize on it
    handles: Mutex<Vec<JoinHandle<()>>>,
}
//
impl ThreadPool {
    /// Pool with one worker per hardware thread
    pub fn new() -> Result<Self, Error> {
        Self::with_threads(max_threads())
    }

    /// Pool with a specific number of workers (clamped to at least one)
    pub fn with_threads(num_workers: usize) -> Result<Self, Error> {
        let workers = (0..num_workers.max(1))
            .map(|_| CachePadded::new(WorkerSlot::new()))
            .collect();
        let pool = Self {
            shared: Arc::new(PoolShared {
                workers,
                overflow: Injector::new(),
                shutdown: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
        };
        pool.spawn_workers()?;
        Ok(pool)
    }

    /// Hand a closure to an idle worker, or queue it for later pickup
    ///
    /// # Panics
    ///
    /// Panics if the pool has been shut down.
    ///
    /// # Safety
    ///
    /// The [`Job`](crate::job::Job) API contract must be honored until the
    /// closure's completion signal has been observed.
    pub unsafe fn submit(&self, job: DynJob) {
        let _handles = self.handles.lock().unwrap();
        assert!(
            !self.shared.shutdown.load(Ordering::Relaxed),
            "work item submitted after pool shutdown"
        );

        if let Some(job) = self.submit_to_idle(job) {
            // Every worker was busy, park the closure on the overflow queue
            self.shared.overflow.push(job);

            // All workers may have gone idle between the scan above and the
            // push, in which case nobody would ever look at the queue again.
            // Waking one idle worker with an empty closure closes that
            // window: it drains the overflow queue before sleeping. If this
            // scan finds nobody idle either, some worker is still running and
            // will drain the queue itself.
            self.submit_to_idle(DynJob::noop());
        }
    }

    /// Claim the first idle worker for `job`; hand it back if all are busy
    fn submit_to_idle(&self, job: DynJob) -> Option<DynJob> {
        for worker in self.shared.workers.iter() {
            if !worker.busy.swap(true, Ordering::Acquire) {
                *worker.slot.lock().unwrap() = Some(job);
                worker.ready.notify_one();
                return None;
            }
        }
        Some(job)
    }

    /// Stop and join every worker, discarding pending overflow work
    ///
    /// Idempotent; [`ThreadPool::restart`] brings the pool back to life.
    pub fn shutdown(&self) {
        // Runs on the Drop path, so a submit that panicked and poisoned the
        // structural mutex must not turn into a double panic here
        let mut handles = match self.handles.lock() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::shutdown_locked(&self.shared, &mut handles);
    }

    fn shutdown_locked(shared: &PoolShared, handles: &mut Vec<JoinHandle<()>>) {
        shared.shutdown.store(true, Ordering::Release);
        for worker in shared.workers.iter() {
            // Hold the handoff mutex so the store cannot slip between a
            // worker's wake-up check and its condvar wait
            let _slot = worker.slot.lock().unwrap();
            worker.ready.notify_all();
        }
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        // Closures that queued up and were never picked up are dropped, not
        // run; a fresh epoch must not execute work from the previous one.
        while let Steal::Success(_) | Steal::Retry = shared.overflow.steal() {}
        log::debug!("thread pool shut down");
    }

    /// Bring a shut-down pool back to life with fresh worker threads
    ///
    /// Workers are not inherited across `fork()`; the post-fork hooks use
    /// this to give both processes a usable pool again.
    pub fn restart(&self) -> Result<(), Error> {
        self.shared.shutdown.store(false, Ordering::Release);
        self.spawn_workers()
    }

    /// Spawn one OS thread per worker record
    ///
    /// On failure, workers that did start are shut down before the error is
    /// propagated.
    fn spawn_workers(&self) -> Result<(), Error> {
        let mut handles = self.handles.lock().unwrap();
        debug_assert!(handles.is_empty(), "spawning over live workers");
        for idx in 0..self.shared.workers.len() {
            // A worker that exited on shutdown may have left its record
            // claimed; re-arm it before the new thread starts
            let worker = &self.shared.workers[idx];
            *worker.slot.lock().unwrap() = None;
            worker.busy.store(false, Ordering::Relaxed);

            let shared = self.shared.clone();
            match std::thread::Builder::new()
                .name(format!("spindle worker #{idx}"))
                .spawn(move || worker_main(&shared, idx))
            {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    Self::shutdown_locked(&self.shared, &mut handles);
                    return Err(Error::Spawn(source));
                }
            }
        }
        log::debug!("thread pool running with {} workers", handles.len());
        Ok(())
    }
}
//
impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State shared between the pool handle and all of its workers
struct PoolShared {
    /// One record per worker, padded so that neighbouring busy flags and
    /// handoff slots never share a cache line
    workers: Box<[CachePadded<WorkerSlot>]>,

    /// Closures that found no idle worker at submit time
    overflow: Injector<DynJob>,

    /// Once set, workers exit their loop; pending overflow work is discarded
    shutdown: AtomicBool,
}

/// Per-worker handoff state
struct WorkerSlot {
    /// Pending closure handed to this worker, if any
    slot: Mutex<Option<DynJob>>,

    /// Signaled when `slot` is filled or the pool shuts down
    ready: Condvar,

    /// Set while a closure is assigned to or executing on this worker; the
    /// single source of truth for "this worker can accept new work now"
    busy: AtomicBool,
}
//
impl WorkerSlot {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
            busy: AtomicBool::new(false),
        }
    }
}

/// Worker main loop: sleep until handed a closure, run it, drain the overflow
/// queue, advertise availability, repeat
fn worker_main(shared: &PoolShared, idx: usize) {
    let me = &shared.workers[idx];
    loop {
        let job = {
            let mut slot = me.slot.lock().unwrap();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = slot.take() {
                    break job;
                }
                slot = me.ready.wait(slot).unwrap();
            }
        };
        run_job(job);

        // Work that queued up while every worker was busy
        loop {
            match shared.overflow.steal() {
                Steal::Success(job) => run_job(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // Advertise availability before going back to sleep
        me.busy.store(false, Ordering::Release);
    }
}

/// Run one closure, containing any panic it lets escape
///
/// Region closures aggregate their own panics; anything that unwinds out of a
/// closure anyway must not take the worker thread down with it.
fn run_job(job: DynJob) {
    // SAFETY: Submitters keep the backing `Job` alive and untouched until its
    //         completion signal, per the `Job` API contract.
    if std::panic::catch_unwind(AssertUnwindSafe(|| unsafe { job.run() })).is_err() {
        log::error!("a pool closure panicked without its own unwind guard");
    }
}

/// Process-wide pool, started on first use
///
/// The pool is never torn down at process exit; workers are detached by
/// program termination, which sidesteps static destruction ordering.
pub(crate) fn global_pool() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        ThreadPool::new().expect("failed to start the worker thread pool")
    });
    #[cfg(unix)]
    register_fork_handlers();
    pool
}

/// Re-initialize the pool on both sides of a `fork()`
///
/// Worker threads do not survive into the child; shutting the pool down
/// before the fork and restarting it on both sides afterwards leaves parent
/// and child with usable pools.
#[cfg(unix)]
fn register_fork_handlers() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        extern "C" fn prepare() {
            global_pool().shutdown();
        }
        extern "C" fn resume() {
            global_pool()
                .restart()
                .expect("failed to restart the worker thread pool after fork");
        }
        let prepare: unsafe extern "C" fn() = prepare;
        let resume: unsafe extern "C" fn() = resume;
        // SAFETY: The handlers only touch the global pool, which is built
        //         before registration and lives for the whole process.
        unsafe { libc::pthread_atfork(Some(prepare), Some(resume), Some(resume)) };
    });
}
