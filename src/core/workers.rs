//! Background worker pool for frame loads and speculative prefetch
//!
//! Uses work-stealing deques:
//! - New jobs go to the global injector, which idle workers poll first
//! - Workers steal from each other when the injector is empty
//!
//! Epoch-checked jobs are dropped at execution time if their job cache was
//! invalidated or closed after they were queued.

use crossbeam::deque::{Injector, Stealer, Worker};
use log::trace;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::entities::WorkerPool;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Work-stealing thread pool
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    /// Spawn `num_threads` workers (at least one)
    pub fn new(num_threads: usize) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(|w| w.stealer()).collect();

        let mut handles = Vec::with_capacity(num_threads);
        for (worker_id, local) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("framecache-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    loop {
                        if let Some(job) = local.pop() {
                            job();
                            continue;
                        }
                        if let Some(job) = injector.steal_batch_and_pop(&local).success() {
                            job();
                            continue;
                        }
                        if let Some(job) = stealers.iter().find_map(|s| s.steal().success()) {
                            job();
                            continue;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        // idle: short sleep instead of spinning
                        thread::sleep(Duration::from_millis(1));
                    }
                    trace!("Worker {} stopped", worker_id);
                })?;
            handles.push(handle);
        }

        trace!("Workers initialized: {} threads", num_threads);
        Ok(Self {
            injector,
            handles,
            shutdown,
        })
    }

    /// Default size: 3/4 of the CPU cores, at least one
    pub fn default_threads() -> usize {
        (num_cpus::get() * 3 / 4).max(1)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }

    /// Queue `f`; it runs only if `current` still equals `epoch` when a
    /// worker picks it up.
    pub fn execute_with_epoch<F>(&self, current: Arc<AtomicU64>, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(move || {
            if current.load(Ordering::Acquire) == epoch {
                f();
            } else {
                trace!("Skipping job queued at epoch {}", epoch);
            }
        }));
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);
        self.shutdown.store(true, Ordering::SeqCst);

        // Queued jobs still drain before workers see the flag; the deadline
        // bounds how long shutdown may block on them.
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, detaching remaining workers");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("All {} workers stopped", num_threads);
    }
}

impl WorkerPool for Workers {
    fn execute(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        Workers::execute(self, f)
    }

    fn execute_with_epoch(
        &self,
        current: Arc<AtomicU64>,
        epoch: u64,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) {
        Workers::execute_with_epoch(self, current, epoch, f)
    }
}
