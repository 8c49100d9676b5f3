//! Background pool for frame loads and caching jobs.
//!
//! Work-stealing deques: jobs go to a shared injector, each worker drains its
//! own deque first, then the injector, then steals from siblings.
//!
//! Caching jobs carry the epoch they were scheduled in; a seek bumps the epoch
//! and queued jobs from the old epoch are skipped when a worker picks them up.

use crossbeam::deque::{Injector, Worker};
use log::{info, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool shared by the playlist and the player clock.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4, cache_manager.epoch_ref());
/// let item = Arc::clone(&item);
/// workers.execute(move || item.load_frame(10, false, false));
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    current_epoch: Arc<AtomicU64>, // shared with CacheManager
    shutdown: Arc<AtomicBool>,
    /// Jobs queued or running
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("threads", &self.handles.len())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl Workers {
    /// Create the pool.
    ///
    /// * `num_threads` - worker threads, at least one is spawned
    /// * `epoch` - shared epoch counter for cancelling stale caching jobs
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut locals: Vec<Worker<Job>> = Vec::with_capacity(num_threads);
        let mut stealers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            locals.push(worker);
        }

        let mut handles = Vec::with_capacity(num_threads);
        for (worker_id, worker) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let in_flight = Arc::clone(&in_flight);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("playtree-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    let run = |job: Job| {
                        job();
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                    };

                    loop {
                        if let Some(job) = worker.pop() {
                            run(job);
                            continue;
                        }
                        if let Some(job) = injector.steal_batch_and_pop(&worker).success() {
                            run(job);
                            continue;
                        }
                        if let Some(job) = stealers
                            .iter()
                            .find_map(|s| s.steal().success())
                        {
                            run(job);
                            continue;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        thread::sleep(Duration::from_millis(1));
                    }

                    trace!("Worker {} stopped", worker_id);
                })
                .expect("Failed to spawn worker thread");

            handles.push(handle);
        }

        info!("Workers initialized: {} threads", num_threads);

        Self {
            injector,
            handles,
            current_epoch: epoch,
            shutdown,
            in_flight,
        }
    }

    /// Thread count to use when the configuration says "auto"
    pub fn auto_threads() -> usize {
        (num_cpus::get() * 3 / 4).max(1)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Run `f` on a worker thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.injector.push(Box::new(f));
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Run `f` only if the epoch still equals `epoch` when a worker picks it up.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);
        self.execute(move || {
            if current_epoch.load(Ordering::Relaxed) == epoch {
                f();
            } else {
                trace!("Skipping stale job (epoch {})", epoch);
            }
        });
    }

    /// Jobs queued or running right now
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Block until every queued job has finished or `timeout` elapses.
    /// Returns true if the pool drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);
        self.shutdown.store(true, Ordering::SeqCst);

        // Threads still busy after the deadline are left to die with the process
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("All {} workers stopped", num_threads);
    }
}
