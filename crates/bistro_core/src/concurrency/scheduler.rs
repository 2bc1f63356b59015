//! Delayed and fixed-rate jobs.

use super::error_sink::ErrorSink;
use super::pool::panic_message;
use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum Job {
    Once(Box<dyn FnOnce() + Send>),
    Repeating(Arc<dyn Fn() + Send + Sync>, Duration),
}

struct Entry {
    due: Instant,
    seq: u64,
    name: String,
    cancelled: Arc<AtomicBool>,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; earliest due first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    errors: Arc<ErrorSink>,
}

/// Cancels a scheduled job when asked.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    /// Prevents any further run of the job.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs jobs after a delay or at a fixed rate on a small set of threads.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts `threads` scheduler threads.
    pub fn new(threads: usize, errors: Arc<ErrorSink>) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            errors,
        });
        let mut handles = Vec::new();
        for n in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name(format!("bistro-sched-{n}"))
                    .spawn(move || run(&shared))?,
            );
        }
        Ok(Self {
            shared,
            threads: Mutex::new(handles),
        })
    }

    fn push(&self, name: &str, delay: Duration, job: Job) -> CoreResult<ScheduledHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            return Err(CoreError::invalid_operation("scheduler is shut down"));
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry {
            due: Instant::now() + delay,
            seq,
            name: name.to_string(),
            cancelled: Arc::clone(&cancelled),
            job,
        });
        drop(queue);
        self.shared.wakeup.notify_one();
        Ok(ScheduledHandle { cancelled })
    }

    /// Runs `f` once after `delay`.
    pub fn schedule<F>(&self, name: &str, delay: Duration, f: F) -> CoreResult<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(name, delay, Job::Once(Box::new(f)))
    }

    /// Runs `f` after `initial` and then every `period`, measured from each
    /// scheduled start rather than from each completion.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        name: &str,
        initial: Duration,
        period: Duration,
        f: F,
    ) -> CoreResult<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(CoreError::invalid_operation("period must be non-zero"));
        }
        self.push(name, initial, Job::Repeating(Arc::new(f), period))
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Drops all pending jobs and stops the threads.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopped = true;
            queue.heap.clear();
        }
        self.shared.wakeup.notify_all();
        let deadline = Instant::now() + timeout;
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        while !threads.iter().all(JoinHandle::is_finished) {
            if Instant::now() >= deadline {
                tracing::warn!("scheduler threads still busy after shutdown");
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        for t in threads {
            let _ = t.join();
        }
        true
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.queue.lock().stopped = true;
        self.shared.wakeup.notify_all();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(shared: &Shared) {
    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.stopped {
                    return;
                }
                let now = Instant::now();
                match queue.heap.peek().map(|e| e.due) {
                    Some(due) if due <= now => break,
                    Some(due) => {
                        shared.wakeup.wait_until(&mut queue, due);
                    }
                    None => shared.wakeup.wait(&mut queue),
                }
            }
            let Some(entry) = queue.heap.pop() else {
                continue;
            };
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            if let Job::Repeating(f, period) = &entry.job {
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.heap.push(Entry {
                    due: entry.due + *period,
                    seq,
                    name: entry.name.clone(),
                    cancelled: Arc::clone(&entry.cancelled),
                    job: Job::Repeating(Arc::clone(f), *period),
                });
                shared.wakeup.notify_one();
            }
            entry
        };

        let name = entry.name;
        let outcome = match entry.job {
            Job::Once(f) => panic::catch_unwind(AssertUnwindSafe(f)),
            Job::Repeating(f, _) => panic::catch_unwind(AssertUnwindSafe(|| f())),
        };
        if let Err(payload) = outcome {
            shared
                .errors
                .report(&name, format!("panicked: {}", panic_message(payload.as_ref())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn scheduler() -> (Scheduler, Arc<ErrorSink>) {
        let errors = Arc::new(ErrorSink::default());
        (Scheduler::new(2, Arc::clone(&errors)).unwrap(), errors)
    }

    #[test]
    fn delayed_job_runs_once() {
        let (sched, _) = scheduler();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        sched
            .schedule("once", Duration::from_millis(30), move || {
                tx.send(Instant::now()).unwrap();
            })
            .unwrap();
        let ran_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ran_at.duration_since(start) >= Duration::from_millis(30));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn earlier_jobs_run_first() {
        let (sched, _) = scheduler();
        let (tx, rx) = mpsc::channel();
        let late = tx.clone();
        sched
            .schedule("late", Duration::from_millis(80), move || {
                late.send("late").unwrap();
            })
            .unwrap();
        sched
            .schedule("early", Duration::from_millis(10), move || {
                tx.send("early").unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn fixed_rate_repeats_until_cancelled() {
        let (sched, _) = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = sched
            .schedule_at_fixed_rate("tick", Duration::ZERO, Duration::from_millis(10), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.cancel();
        thread::sleep(Duration::from_millis(30));
        let settled = count.load(Ordering::SeqCst);
        assert!(settled >= 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn panicking_job_is_reported() {
        let (sched, errors) = scheduler();
        sched
            .schedule("bad", Duration::ZERO, || panic!("scheduled panic"))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while errors.total() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(errors.recent()[0].task, "bad");
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let (sched, _) = scheduler();
        sched
            .schedule("never", Duration::from_secs(60), || {})
            .unwrap();
        assert!(sched.shutdown(Duration::from_secs(1)));
        assert_eq!(sched.pending(), 0);
        assert!(sched.schedule("late", Duration::ZERO, || {}).is_err());
    }
}
