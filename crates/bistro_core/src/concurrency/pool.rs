//! Fixed-size worker pools.

use super::error_sink::ErrorSink;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Handle to the result of a task submitted with [`WorkerPool::spawn`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    task: String,
    rx: Receiver<CoreResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes.
    ///
    /// Returns [`CoreError::TaskFailed`] if the task panicked or was
    /// discarded by a pool shutdown.
    pub fn join(self) -> CoreResult<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(CoreError::task_failed(self.task, "task was discarded")))
    }

    /// Waits at most `timeout` for the task.
    ///
    /// On timeout the handle is returned so the caller can wait again.
    pub fn join_timeout(self, timeout: Duration) -> Result<CoreResult<T>, Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(CoreError::task_failed(
                self.task,
                "task was discarded",
            ))),
        }
    }

    /// Name the task was submitted with.
    pub fn task(&self) -> &str {
        &self.task
    }
}

/// A named pool of worker threads fed from a shared queue.
///
/// Every job runs under `catch_unwind`; panics and task errors are
/// reported to the [`ErrorSink`] and never kill a worker.
pub struct WorkerPool {
    id: u64,
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    discard: Arc<AtomicBool>,
    errors: Arc<ErrorSink>,
}

impl WorkerPool {
    /// Starts a pool of `threads` workers (at least one).
    pub fn new(name: &str, threads: usize, errors: Arc<ErrorSink>) -> CoreResult<Self> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let discard = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(threads.max(1));
        for n in 0..threads.max(1) {
            let rx = Arc::clone(&rx);
            let discard = Arc::clone(&discard);
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_loop(id, &rx, &discard))?;
            workers.push(handle);
        }
        tracing::debug!(pool = name, threads = workers.len(), "worker pool started");

        Ok(Self {
            id,
            name: name.to_string(),
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            discard,
            errors,
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Returns true when called from one of this pool's workers.
    pub fn is_current(&self) -> bool {
        CURRENT_POOL.with(|c| c.get() == self.id)
    }

    fn submit(&self, job: Job) -> CoreResult<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(CoreError::invalid_operation(format!(
                "pool {} is shut down",
                self.name
            )));
        };
        tx.send(job)
            .map_err(|_| CoreError::invalid_operation(format!("pool {} is shut down", self.name)))
    }

    /// Submits a task whose result is delivered through a [`TaskHandle`].
    pub fn spawn<T, F>(&self, task: &str, f: F) -> CoreResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> CoreResult<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let errors = Arc::clone(&self.errors);
        let name = task.to_string();
        self.submit(Box::new(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    errors.report(&name, e.to_string());
                    Err(e)
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    errors.report(&name, format!("panicked: {message}"));
                    Err(CoreError::task_failed(name, message))
                }
            };
            let _ = tx.send(result);
        }))?;
        Ok(TaskHandle {
            task: task.to_string(),
            rx,
        })
    }

    /// Submits a fire-and-forget task.
    pub fn execute<F>(&self, task: &str, f: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let errors = Arc::clone(&self.errors);
        let name = task.to_string();
        self.submit(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                errors.report(&name, format!("panicked: {}", panic_message(payload.as_ref())));
            }
        }))
    }

    /// Stops accepting work and waits for the workers to finish.
    ///
    /// Queued jobs keep running for up to `timeout`. After that the queue
    /// is discarded and the pool waits one more `timeout` for running jobs.
    /// Returns false if some worker was still busy at the end.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        drop(self.sender.lock().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return true;
        }

        if !wait_finished(&workers, timeout) {
            tracing::warn!(pool = %self.name, "pool did not drain in time, discarding queued jobs");
            self.discard.store(true, Ordering::SeqCst);
            if !wait_finished(&workers, timeout) {
                tracing::warn!(pool = %self.name, "pool workers still busy after shutdown");
                return false;
            }
        }
        for worker in workers {
            let _ = worker.join();
        }
        tracing::debug!(pool = %self.name, "worker pool stopped");
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.lock().take());
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}

fn worker_loop(pool_id: u64, rx: &Mutex<Receiver<Job>>, discard: &AtomicBool) {
    CURRENT_POOL.with(|c| c.set(pool_id));
    loop {
        let job = rx.lock().recv();
        match job {
            Ok(job) => {
                if discard.load(Ordering::SeqCst) {
                    continue;
                }
                job();
            }
            Err(_) => break,
        }
    }
}

fn wait_finished(workers: &[JoinHandle<()>], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if workers.iter().all(JoinHandle::is_finished) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(threads: usize) -> (WorkerPool, Arc<ErrorSink>) {
        let errors = Arc::new(ErrorSink::default());
        (
            WorkerPool::new("test", threads, Arc::clone(&errors)).unwrap(),
            errors,
        )
    }

    #[test]
    fn spawn_returns_value() {
        let (pool, _) = pool(2);
        let handle = pool.spawn("add", || Ok(2 + 2)).unwrap();
        assert_eq!(handle.join().unwrap(), 4);
    }

    #[test]
    fn panics_are_reported_not_fatal() {
        let (pool, errors) = pool(1);
        let handle = pool
            .spawn::<(), _>("explode", || panic!("kaboom"))
            .unwrap();
        let err = handle.join().unwrap_err();
        assert!(matches!(err, CoreError::TaskFailed { ref message, .. } if message == "kaboom"));
        assert_eq!(errors.total(), 1);

        // the single worker survived
        assert_eq!(pool.spawn("after", || Ok(1)).unwrap().join().unwrap(), 1);
    }

    #[test]
    fn task_errors_reach_the_sink() {
        let (pool, errors) = pool(1);
        let result = pool
            .spawn::<(), _>("fail", || Err(CoreError::connection("gone")))
            .unwrap()
            .join();
        assert!(result.is_err());
        assert_eq!(errors.recent()[0].task, "fail");
    }

    #[test]
    fn is_current_inside_worker() {
        let (pool, _) = pool(1);
        assert!(!pool.is_current());
        let pool = Arc::new(pool);
        let inner = Arc::clone(&pool);
        let inside = pool.spawn("inside", move || Ok(inner.is_current())).unwrap();
        assert!(inside.join().unwrap());
    }

    #[test]
    fn shutdown_runs_queued_jobs_then_rejects() {
        let (pool, _) = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute("count", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(pool.execute("late", || {}).is_err());
    }

    #[test]
    fn shutdown_discards_backlog_after_timeout() {
        let (pool, _) = pool(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        pool.execute("slow", move || {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(300));
        })
        .unwrap();
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let ran = Arc::clone(&ran);
                pool.spawn("queued", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    Ok(())
                })
                .unwrap()
            })
            .collect();

        started_rx.recv().unwrap();
        assert!(!pool.shutdown(Duration::from_millis(20)));
        let discarded = handles
            .into_iter()
            .map(TaskHandle::join)
            .filter(Result::is_err)
            .count();
        assert_eq!(discarded, 5);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
