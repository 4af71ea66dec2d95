use crate::error::UsageError;

/// A job handed to an executor. Completion is reported out of band: the
/// scheduler wraps every body so that it sends its outcome over the run's
/// completion channel before returning.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The minimal contract the scheduler needs from a worker pool.
///
/// Any concrete pool satisfies it: OS threads, OS processes, or a remote
/// dispatcher. The scheduler never blocks on a job and relies on nothing
/// beyond `submit` plus its own completion channel.
pub trait Executor: Send + Sync {
    /// Queues a job for execution on some worker.
    fn submit(&self, job: Job);

    /// Stops accepting work. With `wait`, blocks until queued jobs finish.
    fn shutdown(&self, wait: bool);
}

/// The built-in executor: a dedicated rayon thread pool.
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
}

impl ThreadPoolExecutor {
    /// Builds a pool with `workers` OS threads.
    pub fn new(workers: usize) -> Result<Self, UsageError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("karakuri-worker-{i}"))
            .build()
            .map_err(|err| UsageError::Other(format!("failed to build worker pool: {err}")))?;
        Ok(Self { pool })
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit(&self, job: Job) {
        self.pool.spawn(job);
    }

    fn shutdown(&self, _wait: bool) {
        // Dropping a rayon pool joins its threads; queued jobs run to
        // completion. The scheduler has already drained by the time it
        // calls this.
    }
}
