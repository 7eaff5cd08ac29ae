//! Work distribution policies and the driver entry points
//!
//! One parallel region = one [`Distribution`], stack-owned by the driver and
//! borrowed by the per-worker [`Scheduler`] views for the duration of the
//! region.

use crate::range::Range;
use crate::resolve_nthreads;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[cfg(feature = "threads")]
use crate::{job::Job, latch::Latch, pool};
#[cfg(feature = "threads")]
use std::any::Any;
#[cfg(feature = "threads")]
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

/// Per-worker view of one parallel region, passed to the loop body
///
/// The handle is only valid for the duration of the body call; bodies must
/// not retain it. The usual idiom pulls chunks until exhaustion:
///
/// ```
/// # use spindle::Scheduler;
/// # fn process(_: spindle::Range) {}
/// # spindle::exec_static(100, 2, 0, |sched: &mut dyn Scheduler| {
/// while let Some(range) = sched.next_chunk() {
///     process(range);
/// }
/// # });
/// ```
pub trait Scheduler {
    /// Width of the current parallel region (not the pool size)
    fn num_threads(&self) -> usize;

    /// 0-based index of the calling worker within the region
    fn thread_num(&self) -> usize;

    /// The next subrange assigned to this worker
    ///
    /// Returns `None` once the region's iteration space is exhausted for this
    /// worker; a returned range is never empty.
    fn next_chunk(&mut self) -> Option<Range>;
}

/// Mode-specific scheduling state
///
/// Keeping the cursors inside the variant means state that a given mode does
/// not use simply does not exist.
enum Mode {
    /// The whole iteration space goes to the region's only worker in one chunk
    Single { done: AtomicBool },

    /// Interleaved block-cyclic assignment; worker `i` only ever touches its
    /// own cursor, so the cursors are padded instead of locked
    Static {
        next_start: Box<[CachePadded<AtomicUsize>]>,
    },

    /// One shared cursor for all workers; chunks shrink geometrically with
    /// the remaining work when `fact_max > 0`
    Dynamic { cur: Mutex<usize>, fact_max: f64 },
}

/// Scheduling state of one parallel region
pub(crate) struct Distribution {
    nthreads: usize,
    nwork: usize,
    chunk: usize,
    mode: Mode,
}
//
impl Distribution {
    /// Serial region: one worker, one chunk covering everything
    fn single(nwork: usize) -> Self {
        Self {
            nthreads: 1,
            nwork,
            chunk: nwork.max(1),
            mode: Mode::Single {
                done: AtomicBool::new(false),
            },
        }
    }

    /// Block-cyclic static assignment
    ///
    /// `nthreads == 0` selects the process default; `chunksize == 0` selects
    /// one chunk per worker. Collapses to [`Distribution::single`] when one
    /// chunk already covers the whole iteration space.
    fn static_chunks(nwork: usize, nthreads: usize, chunksize: usize) -> Self {
        let nthreads = resolve_nthreads(nthreads);
        let chunk = if chunksize == 0 {
            nwork.div_ceil(nthreads)
        } else {
            chunksize
        };
        if chunk >= nwork {
            return Self::single(nwork);
        }
        let next_start = (0..nthreads)
            .map(|i| CachePadded::new(AtomicUsize::new(i * chunk)))
            .collect();
        Self {
            nthreads,
            nwork,
            chunk,
            mode: Mode::Static { next_start },
        }
    }

    /// Shared-cursor assignment, plain (`fact_max == 0`) or guided
    ///
    /// Collapses to [`Distribution::static_chunks`] when the minimum chunks
    /// alone already cover the whole iteration space.
    fn dynamic_chunks(nwork: usize, nthreads: usize, chunksize_min: usize, fact_max: f64) -> Self {
        let nthreads = resolve_nthreads(nthreads);
        let chunk = chunksize_min.max(1);
        if chunk.saturating_mul(nthreads) >= nwork {
            return Self::static_chunks(nwork, nthreads, 0);
        }
        Self {
            nthreads,
            nwork,
            chunk,
            mode: Mode::Dynamic {
                cur: Mutex::new(0),
                fact_max,
            },
        }
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    /// Next subrange for worker `thread_id`, `None` once its share of the
    /// iteration space is exhausted
    pub fn next(&self, thread_id: usize) -> Option<Range> {
        match &self.mode {
            Mode::Single { done } => {
                if self.nwork == 0 || done.swap(true, Ordering::Relaxed) {
                    None
                } else {
                    Some(Range::new(0, self.nwork))
                }
            }
            Mode::Static { next_start } => {
                // Relaxed suffices: each cursor has a single writer, the
                // worker it belongs to
                let cursor = &next_start[thread_id];
                let lo = cursor.load(Ordering::Relaxed);
                if lo >= self.nwork {
                    return None;
                }
                let hi = lo.saturating_add(self.chunk).min(self.nwork);
                let stride = self.nthreads.saturating_mul(self.chunk);
                cursor.store(lo.saturating_add(stride), Ordering::Relaxed);
                Some(Range::new(lo, hi))
            }
            Mode::Dynamic { cur, fact_max } => {
                let mut cur = cur.lock().unwrap();
                if *cur >= self.nwork {
                    return None;
                }
                let rem = self.nwork - *cur;
                let guided = (fact_max * rem as f64 / self.nthreads as f64) as usize;
                let size = rem.min(self.chunk.max(guided));
                let lo = *cur;
                *cur += size;
                Some(Range::new(lo, *cur))
            }
        }
    }
}

/// Scheduler view handed to the body: worker id + borrowed distribution
struct RegionScheduler<'region> {
    dist: &'region Distribution,
    thread_id: usize,
}
//
impl Scheduler for RegionScheduler<'_> {
    fn num_threads(&self) -> usize {
        self.dist.nthreads()
    }

    fn thread_num(&self) -> usize {
        self.thread_id
    }

    fn next_chunk(&mut self) -> Option<Range> {
        self.dist.next(self.thread_id)
    }
}

/// Run `body` once per worker of the region described by `dist`
///
/// Width-1 regions run inline on the calling thread without touching the
/// pool. Wider regions submit one closure per worker and block on a latch
/// until all of them have finished; if any body panicked, the first captured
/// payload is re-raised on the calling thread.
#[cfg(feature = "threads")]
fn thread_map(dist: &Distribution, body: &(dyn Fn(&mut dyn Scheduler) + Sync)) {
    let nthreads = dist.nthreads();
    if nthreads == 1 {
        let mut sched = RegionScheduler { dist, thread_id: 0 };
        body(&mut sched);
        return;
    }

    let pool = pool::global_pool();
    let latch = Latch::new(nthreads);
    let first_panic: Mutex<Option<Box<dyn Any + Send>>> = Mutex::new(None);

    let mut jobs: Vec<_> = (0..nthreads)
        .map(|thread_id| {
            let (latch, first_panic) = (&latch, &first_panic);
            Job::new(move || {
                let mut sched = RegionScheduler { dist, thread_id };
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| body(&mut sched))) {
                    // First failure wins; the latch must count down either
                    // way or the driver would deadlock
                    let mut slot = first_panic.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(payload);
                    }
                }
                latch.count_down();
            })
        })
        .collect();
    for job in &mut jobs {
        // SAFETY: The latch wait below keeps every job alive and untouched
        //         until its closure has finished running.
        unsafe { pool.submit(job.as_dyn()) };
    }
    latch.wait();

    // All closures have finished; release their borrow of the panic slot
    drop(jobs);
    if let Some(payload) = first_panic.into_inner().unwrap() {
        resume_unwind(payload);
    }
}

/// Threading compiled out: every region runs its body once, inline
#[cfg(not(feature = "threads"))]
fn thread_map(dist: &Distribution, body: &(dyn Fn(&mut dyn Scheduler) + Sync)) {
    let mut sched = RegionScheduler { dist, thread_id: 0 };
    body(&mut sched);
}

/// Run `body` serially over `[0, nwork)` behind the [`Scheduler`] interface
///
/// Semantically identical to a plain loop; exists so that generic code can
/// treat the serial case like any other region.
pub fn exec_single<Body>(nwork: usize, body: Body)
where
    Body: Fn(&mut dyn Scheduler) + Sync,
{
    thread_map(&Distribution::single(nwork), &body);
}

/// Run `body` over `[0, nwork)` with block-cyclic static chunking
///
/// Worker `i` owns the chunks starting at `i*chunk`, `(i+nthreads)*chunk`,
/// `(i+2*nthreads)*chunk`, … clipped to `nwork`. `nthreads == 0` selects the
/// process-wide default width, `chunksize == 0` selects one chunk per worker
/// (`⌈nwork/nthreads⌉`).
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let data: Vec<u64> = (0..1000).collect();
/// let sum = AtomicU64::new(0);
/// spindle::exec_static(data.len(), 0, 0, |sched: &mut dyn spindle::Scheduler| {
///     while let Some(range) = sched.next_chunk() {
///         let partial: u64 = range.into_iter().map(|i| data[i]).sum();
///         sum.fetch_add(partial, Ordering::Relaxed);
///     }
/// });
/// assert_eq!(sum.into_inner(), (0..1000).sum());
/// ```
pub fn exec_static<Body>(nwork: usize, nthreads: usize, chunksize: usize, body: Body)
where
    Body: Fn(&mut dyn Scheduler) + Sync,
{
    thread_map(&Distribution::static_chunks(nwork, nthreads, chunksize), &body);
}

/// Run `body` over `[0, nwork)` with dynamic self-scheduling
///
/// Workers pull fixed chunks of `chunksize_min` indices from a shared cursor,
/// which balances loads that static chunking cannot predict.
pub fn exec_dynamic<Body>(nwork: usize, nthreads: usize, chunksize_min: usize, body: Body)
where
    Body: Fn(&mut dyn Scheduler) + Sync,
{
    thread_map(
        &Distribution::dynamic_chunks(nwork, nthreads, chunksize_min, 0.0),
        &body,
    );
}

/// Run `body` over `[0, nwork)` with guided self-scheduling
///
/// Like [`exec_dynamic`], but chunks start at `⌊fact_max·rem/nthreads⌋`
/// indices and shrink with the remaining work `rem`, never below
/// `chunksize_min`. Large early chunks keep contention low, small late chunks
/// keep the tail balanced.
pub fn exec_guided<Body>(
    nwork: usize,
    nthreads: usize,
    chunksize_min: usize,
    fact_max: f64,
    body: Body,
) where
    Body: Fn(&mut dyn Scheduler) + Sync,
{
    thread_map(
        &Distribution::dynamic_chunks(nwork, nthreads, chunksize_min, fact_max),
        &body,
    );
}

/// Run `body` once on each of `nthreads` workers
///
/// Every worker sees exactly the singleton range `[i, i+1)` for its own id;
/// used for replicated work that switches on
/// [`thread_num`](Scheduler::thread_num).
pub fn exec_parallel<Body>(nthreads: usize, body: Body)
where
    Body: Fn(&mut dyn Scheduler) + Sync,
{
    let nthreads = resolve_nthreads(nthreads);
    thread_map(&Distribution::static_chunks(nthreads, nthreads, 1), &body);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drain every worker cursor serially and count per-index visits
    fn visit_counts(dist: &Distribution) -> Vec<u32> {
        let mut seen = vec![0u32; dist.nwork];
        for thread_id in 0..dist.nthreads() {
            while let Some(range) = dist.next(thread_id) {
                assert!(!range.is_empty());
                for i in range {
                    seen[i] += 1;
                }
            }
        }
        seen
    }

    #[test]
    fn single_hands_out_everything_once() {
        let dist = Distribution::single(10);
        assert_eq!(dist.nthreads(), 1);
        assert_eq!(dist.next(0), Some(Range::new(0, 10)));
        assert_eq!(dist.next(0), None);
    }

    #[test]
    fn single_with_no_work_is_immediately_exhausted() {
        let dist = Distribution::single(0);
        assert_eq!(dist.next(0), None);
    }

    #[test]
    #[cfg(feature = "threads")]
    fn static_chunks_are_block_cyclic() {
        let dist = Distribution::static_chunks(100, 4, 10);
        let expect = |tid: usize| -> Vec<Range> {
            (0..)
                .map(|round| (tid + 4 * round) * 10)
                .take_while(|&lo| lo < 100)
                .map(|lo| Range::new(lo, (lo + 10).min(100)))
                .collect()
        };
        for tid in 0..4 {
            let mut got = Vec::new();
            while let Some(range) = dist.next(tid) {
                got.push(range);
            }
            assert_eq!(got, expect(tid), "worker {tid}");
        }
    }

    #[test]
    #[cfg(feature = "threads")]
    fn static_default_chunk_is_one_chunk_per_worker() {
        let dist = Distribution::static_chunks(100, 4, 0);
        for tid in 0..4 {
            assert_eq!(dist.next(tid), Some(Range::new(25 * tid, 25 * (tid + 1))));
            assert_eq!(dist.next(tid), None);
        }
    }

    #[test]
    #[cfg(feature = "threads")]
    fn static_tail_chunk_is_clipped() {
        let dist = Distribution::static_chunks(10, 4, 3);
        assert_eq!(dist.next(0), Some(Range::new(0, 3)));
        assert_eq!(dist.next(1), Some(Range::new(3, 6)));
        assert_eq!(dist.next(2), Some(Range::new(6, 9)));
        assert_eq!(dist.next(3), Some(Range::new(9, 10)));
        for tid in 0..4 {
            assert_eq!(dist.next(tid), None, "worker {tid} got a second chunk");
        }
    }

    #[test]
    fn static_collapses_to_single_when_one_chunk_covers_everything() {
        let dist = Distribution::static_chunks(10, 4, 12);
        assert_eq!(dist.nthreads(), 1);
        assert_eq!(dist.next(0), Some(Range::new(0, 10)));
        assert_eq!(dist.next(0), None);
    }

    #[test]
    #[cfg(feature = "threads")]
    fn dynamic_collapses_to_static_when_minimum_chunks_cover_everything() {
        let dist = Distribution::dynamic_chunks(10, 4, 3, 0.0);
        assert_eq!(dist.nthreads(), 4);
        // Static semantics: chunk defaults to ceil(10/4) = 3
        assert_eq!(dist.next(0), Some(Range::new(0, 3)));
        assert_eq!(dist.next(3), Some(Range::new(9, 10)));
    }

    #[test]
    fn dynamic_chunks_have_the_minimum_size_until_the_tail() {
        let dist = Distribution::dynamic_chunks(100, 4, 8, 0.0);
        let mut sizes = Vec::new();
        while let Some(range) = dist.next(0) {
            sizes.push(range.len());
        }
        assert_eq!(sizes, [8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 4]);
    }

    #[test]
    #[cfg(feature = "threads")]
    fn guided_chunks_shrink_geometrically() {
        let dist = Distribution::dynamic_chunks(1000, 4, 1, 1.0);
        let mut sizes = Vec::new();
        while let Some(range) = dist.next(0) {
            sizes.push(range.len());
        }
        assert_eq!(sizes[0], 250);
        assert_eq!(sizes[1], 187);
        assert!(sizes.windows(2).all(|w| w[1] <= w[0]), "sizes: {sizes:?}");
        assert_eq!(sizes.iter().sum::<usize>(), 1000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn static_covers_every_index_exactly_once(
                nwork in 0..500usize,
                nthreads in 1..9usize,
                chunksize in 0..50usize,
            ) {
                let dist = Distribution::static_chunks(nwork, nthreads, chunksize);
                prop_assert!(visit_counts(&dist).iter().all(|&count| count == 1));
            }

            #[test]
            fn dynamic_covers_every_index_exactly_once(
                nwork in 0..500usize,
                nthreads in 1..9usize,
                chunksize_min in 0..50usize,
                fact_max in 0.0f64..4.0,
            ) {
                let dist =
                    Distribution::dynamic_chunks(nwork, nthreads, chunksize_min, fact_max);
                prop_assert!(visit_counts(&dist).iter().all(|&count| count == 1));
            }

            #[test]
            fn guided_chunk_sizes_never_grow(
                nwork in 1..5000usize,
                nthreads in 1..9usize,
                chunksize_min in 1..20usize,
                fact_max in 0.1f64..4.0,
            ) {
                let dist =
                    Distribution::dynamic_chunks(nwork, nthreads, chunksize_min, fact_max);
                let mut prev = usize::MAX;
                while let Some(range) = dist.next(0) {
                    prop_assert!(range.len() <= prev);
                    prev = range.len();
                }
            }
        }
    }

    #[cfg(feature = "threads")]
    mod regions {
        use super::*;
        use std::panic::{catch_unwind, AssertUnwindSafe};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Once;
        use std::time::Duration;

        fn init_logger() {
            static ONCE: Once = Once::new();
            ONCE.call_once(|| {
                let _ = env_logger::builder().is_test(true).try_init();
            });
        }

        /// Per-worker index collection for a region of the given width
        fn collect_per_worker(
            nthreads: usize,
            exec: impl FnOnce(&(dyn Fn(&mut dyn Scheduler) + Sync)),
        ) -> Vec<Vec<usize>> {
            let per_worker: Vec<Mutex<Vec<usize>>> =
                (0..nthreads).map(|_| Mutex::new(Vec::new())).collect();
            exec(&|sched: &mut dyn Scheduler| {
                assert_eq!(sched.num_threads(), nthreads);
                let mut local = Vec::new();
                while let Some(range) = sched.next_chunk() {
                    local.extend(range);
                }
                per_worker[sched.thread_num()].lock().unwrap().extend(local);
            });
            per_worker
                .into_iter()
                .map(|indices| indices.into_inner().unwrap())
                .collect()
        }

        #[test]
        fn static_region_partitions_like_the_cursors_say() {
            init_logger();
            let per_worker =
                collect_per_worker(4, |body| exec_static(100, 4, 0, body));
            for (tid, indices) in per_worker.iter().enumerate() {
                let expected: Vec<usize> = (25 * tid..25 * (tid + 1)).collect();
                assert_eq!(indices, &expected, "worker {tid}");
            }
        }

        #[test]
        fn dynamic_region_covers_unbalanced_work() {
            init_logger();
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let delays: Vec<u64> = (0..1000).map(|_| rng.gen_range(0..40)).collect();

            let chunk_sizes = Mutex::new(Vec::new());
            let visited: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
            exec_dynamic(1000, 8, 16, |sched: &mut dyn Scheduler| {
                while let Some(range) = sched.next_chunk() {
                    chunk_sizes.lock().unwrap().push(range.len());
                    for i in range {
                        std::thread::sleep(Duration::from_micros(delays[i]));
                        visited[i].fetch_add(1, Ordering::Relaxed);
                    }
                }
            });

            assert!(visited.iter().all(|count| count.load(Ordering::Relaxed) == 1));
            let mut chunk_sizes = chunk_sizes.into_inner().unwrap();
            chunk_sizes.sort_unstable();
            // 1000 = 62 * 16 + 8: every chunk is the minimum except the tail
            assert_eq!(chunk_sizes[0], 8);
            assert!(chunk_sizes[1..].iter().all(|&size| size == 16));
            assert_eq!(chunk_sizes.len(), 63);
        }

        #[test]
        fn parallel_region_runs_each_thread_id_once() {
            init_logger();
            let per_worker = collect_per_worker(6, |body| exec_parallel(6, body));
            for (tid, indices) in per_worker.iter().enumerate() {
                assert_eq!(indices.as_slice(), &[tid], "worker {tid}");
            }
        }

        #[test]
        fn single_region_runs_inline() {
            let caller = std::thread::current().id();
            exec_single(10, |sched: &mut dyn Scheduler| {
                assert_eq!(std::thread::current().id(), caller);
                assert_eq!(sched.num_threads(), 1);
                assert_eq!(sched.thread_num(), 0);
                assert_eq!(sched.next_chunk(), Some(Range::new(0, 10)));
                assert_eq!(sched.next_chunk(), None);
            });
        }

        #[test]
        fn empty_region_still_calls_the_body() {
            let calls = AtomicUsize::new(0);
            exec_static(0, 4, 0, |sched: &mut dyn Scheduler| {
                calls.fetch_add(1, Ordering::Relaxed);
                assert_eq!(sched.next_chunk(), None);
            });
            assert_eq!(calls.load(Ordering::Relaxed), 1);
        }

        #[test]
        fn first_panic_wins_and_the_pool_survives() {
            init_logger();
            let result = catch_unwind(AssertUnwindSafe(|| {
                exec_static(100, 4, 0, |sched: &mut dyn Scheduler| {
                    while let Some(range) = sched.next_chunk() {
                        for i in range {
                            assert!(i != 42, "poisoned index {i}");
                        }
                    }
                });
            }));
            let payload = result.unwrap_err();
            let message = payload
                .downcast_ref::<String>()
                .expect("assert! panics carry a String payload");
            assert!(message.contains("poisoned index"));

            // The region failed as a whole, the pool did not
            let counter = AtomicUsize::new(0);
            exec_static(100, 4, 0, |sched: &mut dyn Scheduler| {
                while let Some(range) = sched.next_chunk() {
                    counter.fetch_add(range.len(), Ordering::Relaxed);
                }
            });
            assert_eq!(counter.load(Ordering::Relaxed), 100);
        }

        #[test]
        fn default_width_follows_the_process_setting() {
            init_logger();
            crate::set_default_nthreads(3);
            let widths = Mutex::new(Vec::new());
            exec_static(50, 0, 0, |sched: &mut dyn Scheduler| {
                widths.lock().unwrap().push(sched.num_threads());
                while sched.next_chunk().is_some() {}
            });
            assert!(widths.into_inner().unwrap().iter().all(|&width| width == 3));

            // Writers clamp to at least one worker
            crate::set_default_nthreads(0);
            assert_eq!(crate::get_default_nthreads(), 1);
            crate::set_default_nthreads(crate::max_threads());
        }
    }
}
