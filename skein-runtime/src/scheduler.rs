//! # Work-Stealing Fiber Scheduler
//!
//! M:N cooperative scheduler with work-stealing.
//!
//! ## Design
//!
//! - Multiple worker threads each with a local deque
//! - A global injection queue for yields and resumptions from off-worker
//!   threads (timers, the host)
//! - Work-stealing for load balancing
//! - Idle workers register themselves, re-check the queues, then park; new
//!   work unparks one registered worker
//!
//! A task is a fiber's interpreter state. Running it evaluates the fiber
//! until it suspends, yields or finishes; the interpreter re-submits it
//! itself, so a worker never holds on to a task it has run.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::cause::Defect;
use crate::config::SchedulerConfig;
use crate::error::RuntimeError;
use crate::interpreter::FiberRuntime;

/// A unit of schedulable work.
pub(crate) type Task = Box<FiberRuntime>;

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// The local deque of the worker running on this thread, if any.
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

struct LocalQueue {
    scheduler: usize,
    deque: Deque<Task>,
}

/// Work-stealing scheduler for fibers.
pub(crate) struct Scheduler {
    /// Distinguishes this scheduler's workers from other runtimes'.
    id: usize,
    /// Configuration.
    config: SchedulerConfig,
    /// Global injection queue.
    global_queue: Injector<Task>,
    /// Stealers for work-stealing, indexed by worker.
    stealers: Vec<Stealer<Task>>,
    /// Unparkers, indexed by worker.
    unparkers: Vec<Unparker>,
    /// Workers that are parked or about to park.
    idle: Mutex<Vec<usize>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Number of active workers.
    active_workers: AtomicUsize,
    /// Worker threads.
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the scheduler and spawn its workers.
    pub(crate) fn start(config: SchedulerConfig) -> Result<Arc<Self>, RuntimeError> {
        let num_workers = config.num_workers.max(1);
        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        let mut parkers = Vec::with_capacity(num_workers);
        let mut unparkers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            parkers.push(parker);
        }

        let scheduler = Arc::new(Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            global_queue: Injector::new(),
            stealers,
            unparkers,
            idle: Mutex::new(Vec::with_capacity(num_workers)),
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            threads: Mutex::new(Vec::with_capacity(num_workers)),
        });

        for (index, (deque, parker)) in deques.into_iter().zip(parkers).enumerate() {
            let worker = Worker { index, scheduler: scheduler.clone(), parker };
            let name = format!("skein-worker-{}", index);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run_loop(deque));
            match spawned {
                Ok(handle) => scheduler.threads.lock().push(handle),
                Err(source) => {
                    let _ = scheduler.shutdown(Duration::from_secs(1));
                    return Err(RuntimeError::WorkerSpawn { name, source });
                }
            }
        }

        debug!(workers = num_workers, "scheduler started");
        Ok(scheduler)
    }

    /// Get the number of workers.
    pub(crate) fn num_workers(&self) -> usize {
        self.unparkers.len()
    }

    /// Check if the scheduler is shutting down.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Submit a runnable task: to the current worker's deque when called
    /// from one of this scheduler's workers, otherwise to the global queue.
    /// Tasks submitted after shutdown are dropped.
    pub(crate) fn schedule(&self, task: Task) {
        if self.is_shutting_down() {
            return;
        }
        let rejected = LOCAL.with(|local| match &*local.borrow() {
            Some(queue) if queue.scheduler == self.id => {
                queue.deque.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = rejected {
            self.global_queue.push(task);
        }
        self.notify();
    }

    /// Submit a task that gave up its slice; it goes behind everything
    /// already waiting in the global queue.
    pub(crate) fn yield_task(&self, task: Task) {
        if self.is_shutting_down() {
            return;
        }
        self.global_queue.push(task);
        self.notify();
    }

    /// Whether the calling thread is one of this scheduler's workers.
    pub(crate) fn on_worker(&self) -> bool {
        LOCAL.with(|local| matches!(&*local.borrow(), Some(queue) if queue.scheduler == self.id))
    }

    fn notify(&self) {
        let sleeper = self.idle.lock().pop();
        if let Some(index) = sleeper {
            self.unparkers[index].unpark();
        }
    }

    /// Request shutdown and wait up to `timeout` for the workers to exit.
    /// Queued tasks are dropped.
    pub(crate) fn shutdown(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.shutdown.store(true, Ordering::Release);
        for unparker in &self.unparkers {
            unparker.unpark();
        }

        let deadline = Instant::now() + timeout;
        let mut unfinished = 0;
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.thread().id() == thread::current().id() {
                // Shut down from inside a worker; it exits once the call
                // returns.
                continue;
            }
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                unfinished += 1;
            }
        }

        let mut dropped = 0usize;
        loop {
            match self.global_queue.steal() {
                Steal::Success(task) => {
                    drop(task);
                    dropped += 1;
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        debug!(dropped, unfinished, "scheduler stopped");

        if unfinished > 0 {
            Err(RuntimeError::Shutdown { unfinished })
        } else {
            Ok(())
        }
    }
}

/// A worker thread in the scheduler.
struct Worker {
    index: usize,
    scheduler: Arc<Scheduler>,
    parker: Parker,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, deque: Deque<Task>) {
        let scheduler = &self.scheduler;
        LOCAL.with(|local| {
            *local.borrow_mut() = Some(LocalQueue { scheduler: scheduler.id, deque });
        });
        scheduler.active_workers.fetch_add(1, Ordering::AcqRel);

        loop {
            if scheduler.is_shutting_down() {
                break;
            }

            if let Some(task) = self.find_work() {
                self.run_task(task);
                continue;
            }

            // Register as idle before the last look, so a task pushed in
            // between is guaranteed to unpark us.
            scheduler.idle.lock().push(self.index);
            if let Some(task) = self.find_work() {
                self.leave_idle();
                self.run_task(task);
                continue;
            }
            self.parker.park_timeout(scheduler.config.idle_park);
            self.leave_idle();
        }

        scheduler.active_workers.fetch_sub(1, Ordering::AcqRel);
        // Drop leftover tasks here, while the scheduler is still alive.
        let leftover = LOCAL.with(|local| local.borrow_mut().take());
        drop(leftover);
    }

    fn leave_idle(&self) {
        self.scheduler.idle.lock().retain(|&index| index != self.index);
    }

    /// Find work using work-stealing.
    fn find_work(&self) -> Option<Task> {
        // 1. Try local queue first
        let local = LOCAL.with(|local| local.borrow().as_ref().and_then(|queue| queue.deque.pop()));
        if local.is_some() {
            return local;
        }

        // 2. Try global queue
        loop {
            match self.scheduler.global_queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 3. Try stealing from other workers
        if !self.scheduler.config.work_stealing {
            return None;
        }
        for (index, stealer) in self.scheduler.stealers.iter().enumerate() {
            if index == self.index {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Run a fiber until it suspends, yields or finishes.
    fn run_task(&self, task: Task) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
            error!(
                worker = self.index,
                defect = %Defect::from_panic(payload),
                "fiber interpreter panicked"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::effect::Effect;
    use crate::exit::Exit;
    use crate::runtime::Runtime;

    fn runtime(workers: usize) -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(workers).build_unchecked()).unwrap()
    }

    #[test]
    fn test_scheduler_creation() {
        let rt = runtime(3);
        assert_eq!(rt.shared().scheduler.num_workers(), 3);
        assert!(!rt.shared().scheduler.on_worker());
    }

    #[test]
    fn test_multiple_fibers() {
        let rt = runtime(2);
        let fibers: Vec<_> = (0..10).map(|i| rt.run_fork(Effect::<i32>::succeed(i))).collect();
        let total: i32 = fibers
            .iter()
            .map(|fiber| match rt.run_blocking(fiber.join()) {
                Exit::Success(n) => n,
                Exit::Failure(_) => 0,
            })
            .sum();
        assert_eq!(total, 45);
    }

    #[test]
    fn test_work_stealing() {
        // A fiber forks many children onto its own worker's deque; the other
        // workers must steal them for the test to finish.
        let rt = runtime(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let program = Effect::for_each(0..100, move |_| {
            let seen = seen.clone();
            Effect::<()>::sync(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .fork()
        })
        .flat_map(|fibers| Effect::for_each(fibers, |fiber| fiber.join()));
        assert!(rt.run_blocking(program).is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_stops_workers() {
        let rt = runtime(2);
        let scheduler = rt.shared().scheduler.clone();
        assert!(rt.shutdown().is_ok());
        assert!(scheduler.is_shutting_down());
        assert_eq!(scheduler.active_workers.load(Ordering::Acquire), 0);
    }
}
