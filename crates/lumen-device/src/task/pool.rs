use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

/// Lifecycle of a submitted task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Cancelled,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Completed,
            _ => Self::Cancelled,
        }
    }
}

/// How a task body ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
}

impl From<TaskOutcome> for TaskState {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed => TaskState::Completed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }
}

/// Observes one submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    fn new(state: TaskState) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(state as u8)),
        }
    }

    fn set(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// A handle for work that already ran on the caller's thread.
    pub fn finished(outcome: TaskOutcome) -> Self {
        Self::new(outcome.into())
    }
}

/// Pool-wide cancellation flag checked by running tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

type Job = Box<dyn FnOnce(&CancelToken) -> TaskOutcome + Send + 'static>;

struct Queued {
    job: Job,
    handle: TaskHandle,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Queued>,
    running: usize,
    stopping: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    /// Signalled when a job is queued or the pool stops.
    work: Condvar,
    /// Signalled when the pool may have drained.
    idle: Condvar,
    cancel: CancelToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Worker {
    id: usize,
    handle: Option<thread::JoinHandle<()>>,
}

/// Fixed set of worker threads executing task bodies in submission order.
///
/// Cancellation is cooperative: queued tasks are dropped as cancelled and
/// running ones see the [`CancelToken`] at their next checkpoint.
pub struct TaskPool {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
}

impl TaskPool {
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
            cancel: CancelToken::default(),
        });

        let mut workers = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(Worker {
                id,
                handle: Some(handle),
            });
        }

        Ok(Self { shared, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `job` for the next free worker.
    pub fn push<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce(&CancelToken) -> TaskOutcome + Send + 'static,
    {
        let handle = TaskHandle::new(TaskState::Queued);
        let mut queue = self.shared.lock();
        if queue.stopping {
            handle.set(TaskState::Cancelled);
            return handle;
        }
        queue.jobs.push_back(Queued {
            job: Box::new(job),
            handle: handle.clone(),
        });
        drop(queue);

        self.shared.work.notify_one();
        handle
    }

    /// Blocks until the queue is empty and no task is running.
    pub fn wait(&self) {
        let mut queue = self.shared.lock();
        while !queue.jobs.is_empty() || queue.running > 0 {
            queue = self.shared.idle.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Drops queued tasks and waits for running ones to reach a checkpoint.
    pub fn cancel(&self) {
        let mut queue = self.shared.lock();
        for queued in queue.jobs.drain(..) {
            queued.handle.set(TaskState::Cancelled);
        }
        self.shared.cancel.cancel();

        while queue.running > 0 {
            queue = self.shared.idle.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
        self.shared.cancel.reset();
    }

    /// Whether a cancellation is in progress.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Cancels everything and joins the workers.
    pub fn stop(&mut self) {
        self.cancel();
        self.shared.lock().stopping = true;
        self.shared.work.notify_all();

        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    log::error!("task worker {} panicked", worker.id);
                }
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let queued = {
            let mut queue = shared.lock();
            loop {
                if let Some(queued) = queue.jobs.pop_front() {
                    queue.running += 1;
                    break queued;
                }
                if queue.stopping {
                    return;
                }
                queue = shared.work.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };

        queued.handle.set(TaskState::Running);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (queued.job)(&shared.cancel)))
            .unwrap_or_else(|payload| {
                log::error!("task panicked: {}", panic_message(payload.as_ref()));
                TaskOutcome::Cancelled
            });
        queued.handle.set(outcome.into());

        let mut queue = shared.lock();
        queue.running -= 1;
        if queue.jobs.is_empty() && queue.running == 0 {
            shared.idle.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_every_job_before_wait_returns() {
        let pool = TaskPool::new("test", 3).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let count = Arc::clone(&count);
                pool.push(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                    TaskOutcome::Completed
                })
            })
            .collect();

        pool.wait();
        assert_eq!(count.load(Ordering::SeqCst), 16);
        assert!(handles.iter().all(|h| h.state() == TaskState::Completed));
    }

    #[test]
    fn cancel_drops_queued_and_stops_running() {
        let pool = TaskPool::new("test", 1).unwrap();
        let (started_tx, started_rx) = mpsc::channel();

        let running = pool.push(move |cancel| {
            started_tx.send(()).unwrap();
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            TaskOutcome::Cancelled
        });
        let queued = pool.push(|_| TaskOutcome::Completed);

        started_rx.recv().unwrap();
        pool.cancel();

        assert_eq!(running.state(), TaskState::Cancelled);
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert!(!pool.is_cancelled());

        // The pool keeps working after a cancel.
        let after = pool.push(|cancel| {
            assert!(!cancel.is_cancelled());
            TaskOutcome::Completed
        });
        pool.wait();
        assert_eq!(after.state(), TaskState::Completed);
    }

    #[test]
    fn stopped_pool_rejects_work() {
        let mut pool = TaskPool::new("test", 2).unwrap();
        pool.stop();
        let handle = pool.push(|_| TaskOutcome::Completed);
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn a_panicking_job_is_cancelled_and_the_pool_carries_on() {
        let pool = Arc::new(TaskPool::new("test", 1).unwrap());
        let panicked = pool.push(|_| panic!("tile source went away"));
        let after = pool.push(|_| TaskOutcome::Completed);

        let (done_tx, done_rx) = mpsc::channel();
        let waiter = Arc::clone(&pool);
        thread::spawn(move || {
            waiter.wait();
            done_tx.send(()).unwrap();
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok(), "wait hung");

        assert_eq!(panicked.state(), TaskState::Cancelled);
        assert_eq!(after.state(), TaskState::Completed);
        pool.cancel();
    }
}
