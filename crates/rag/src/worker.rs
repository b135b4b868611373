use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use kbase_core::{KbError, Result};

/// Background work queued by the corpus lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Chunk a finalized corpus, then embed its chunks.
    GenerateChunks { corpus_id: i64 },
    /// Embed the corpus chunks that still lack a vector.
    Revectorize { corpus_id: i64 },
}

impl Job {
    pub fn corpus_id(&self) -> i64 {
        match self {
            Job::GenerateChunks { corpus_id } | Job::Revectorize { corpus_id } => *corpus_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Job::GenerateChunks { .. } => "generate_chunks",
            Job::Revectorize { .. } => "revectorize",
        }
    }
}

pub type JobHandler = dyn Fn(&Job) -> Result<()> + Send + Sync;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

struct DoneGuard<'a>(&'a Pending);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Fixed set of threads draining a job channel. Callers never wait on an
/// individual job; [`WorkerPool::wait_idle`] blocks until the queue is
/// empty and no job is running.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl WorkerPool {
    pub fn start(threads: usize, handler: Arc<JobHandler>) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let pending = Arc::new(Pending::default());
        let handles = (0..threads)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let handler = Arc::clone(&handler);
                let pending = Arc::clone(&pending);
                thread::spawn(move || worker_loop(worker_id, receiver, handler, pending))
            })
            .collect();
        debug!(threads, "started worker pool");
        Self {
            sender: Some(sender),
            handles,
            pending,
        }
    }

    pub fn submit(&self, job: Job) -> Result<()> {
        let Some(sender) = &self.sender else {
            return Err(KbError::validation("worker pool is shut down"));
        };
        self.pending.add();
        if sender.send(job).is_err() {
            self.pending.done();
            return Err(KbError::validation("worker pool is shut down"));
        }
        debug!(job = job.name(), corpus_id = job.corpus_id(), "queued job");
        Ok(())
    }

    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<Job>,
    handler: Arc<JobHandler>,
    pending: Arc<Pending>,
) {
    for job in receiver.iter() {
        let _done = DoneGuard(&pending);
        debug!(worker_id, job = job.name(), corpus_id = job.corpus_id(), "running job");
        if let Err(err) = handler(&job) {
            error!(
                worker_id,
                job = job.name(),
                corpus_id = job.corpus_id(),
                kind = err.kind(),
                error = %err,
                "job failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_idle_returns_after_all_jobs_ran() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler: Arc<JobHandler> = Arc::new(move |job: &Job| -> Result<()> {
            counter.fetch_add(job.corpus_id() as usize, Ordering::SeqCst);
            Ok(())
        });
        let pool = WorkerPool::start(3, handler);
        for corpus_id in 1..=10 {
            pool.submit(Job::Revectorize { corpus_id }).unwrap();
        }
        pool.wait_idle();
        assert_eq!(seen.load(Ordering::SeqCst), 55);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn failing_jobs_do_not_stall_the_pool() {
        let handler: Arc<JobHandler> = Arc::new(|_: &Job| -> Result<()> {
            Err(KbError::embedding("backend unavailable"))
        });
        let pool = WorkerPool::start(1, handler);
        pool.submit(Job::GenerateChunks { corpus_id: 1 }).unwrap();
        pool.submit(Job::GenerateChunks { corpus_id: 2 }).unwrap();
        pool.wait_idle();
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn idle_pool_does_not_block() {
        let handler: Arc<JobHandler> = Arc::new(|_: &Job| -> Result<()> { Ok(()) });
        let pool = WorkerPool::start(2, handler);
        pool.wait_idle();
    }
}
