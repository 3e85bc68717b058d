//! # Runtime
//!
//! The host-facing entry point: owns the worker pool, the timer thread and
//! the global scope every root and daemon fiber is registered in.
//!
//! ## Design
//!
//! - [`Runtime::run_fork`] starts a root fiber and returns its handle;
//!   [`Runtime::run_blocking`] additionally blocks the calling host thread
//!   on a channel until the fiber's exit is published.
//! - Shutdown closes the global scope (interrupting and awaiting every root
//!   and daemon fiber) within `shutdown_timeout`, then stops the workers
//!   and the timer. Dropping the runtime shuts it down.
//! - Once shutdown has started, newly submitted effects are not run; their
//!   fibers complete at once with an interruption attributed to no fiber.
//!
//! # Example
//!
//! ```rust
//! use skein_runtime::{Effect, Exit, Runtime};
//!
//! let rt = Runtime::builder().num_workers(2).build().unwrap();
//! let exit = rt.run_blocking(Effect::<i32>::succeed(20).map(|n| n + 22));
//! assert_eq!(exit, Exit::Success(42));
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cause::Defect;
use crate::config::{LogLevel, RuntimeConfig, RuntimeConfigBuilder};
use crate::effect::primitive::{share_value, typed_exit, Share, SharedExit};
use crate::effect::{Effect, EffectError, Primitive};
use crate::error::RuntimeError;
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberCore};
use crate::fiber_id::FiberId;
use crate::fiber_ref::FiberRefs;
use crate::flags::RuntimeFlags;
use crate::interpreter::{spawn, ForkOptions};
use crate::scheduler::Scheduler;
use crate::scope::Scope;
use crate::timer::Timer;

/// State shared by the runtime handle and every fiber it runs.
pub(crate) struct RuntimeShared {
    pub(crate) scheduler: Arc<Scheduler>,
    timer: Arc<Timer>,
    pub(crate) global_scope: Scope,
    pub(crate) config: RuntimeConfig,
    stopped: AtomicBool,
}

impl RuntimeShared {
    pub(crate) fn timer(&self) -> Arc<Timer> {
        self.timer.clone()
    }
}

/// A running effect runtime.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    /// Start a runtime with `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let timer = Timer::start()
            .map_err(|source| RuntimeError::WorkerSpawn { name: "skein-timer".into(), source })?;
        let scheduler = match Scheduler::start(config.scheduler.clone()) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                timer.shutdown(Duration::from_secs(1));
                return Err(err);
            }
        };

        info!(
            workers = scheduler.num_workers(),
            ops_before_yield = config.scheduler.ops_before_yield,
            work_stealing = config.scheduler.work_stealing,
            "runtime started"
        );

        Ok(Self {
            shared: Arc::new(RuntimeShared {
                scheduler,
                timer,
                global_scope: Scope::new(),
                config,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Start a runtime configured from `SKEIN_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::try_from_env()?)
    }

    /// A builder starting from the default configuration.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The configuration the runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The scope root and daemon fibers are registered in.
    pub fn global_scope(&self) -> &Scope {
        &self.shared.global_scope
    }

    /// Whether shutdown has started.
    pub fn is_shutdown(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn shared(&self) -> &Arc<RuntimeShared> {
        &self.shared
    }

    /// Run `effect` on a new root fiber.
    pub fn run_fork<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: EffectError,
    {
        self.run_fork_with_refs(effect, FiberRefs::empty())
    }

    /// Run `effect` on a new root fiber starting from `refs`.
    pub fn run_fork_with_refs<A, E>(&self, effect: Effect<A, E>, refs: FiberRefs) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: EffectError,
    {
        Fiber::from_core(self.fork_root(effect.into_primitive(), share_value::<A>, refs))
    }

    /// Run `effect` on a new root fiber and block until it finishes.
    ///
    /// Must be called from a host thread; called from one of the runtime's
    /// own workers it refuses with a defect instead of deadlocking.
    pub fn run_blocking<A, E>(&self, effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: EffectError,
    {
        if self.shared.scheduler.on_worker() {
            return Exit::die(Defect::new("run_blocking called from a runtime worker"));
        }
        let core = self.fork_root(effect.into_primitive(), share_value::<A>, FiberRefs::empty());
        match wait_for(&core, None) {
            Some(exit) => typed_exit(&exit),
            None => Exit::interrupt(FiberId::None),
        }
    }

    fn fork_root(&self, body: Primitive, share: Share, refs: FiberRefs) -> Arc<FiberCore> {
        if self.is_shutdown() {
            let core = FiberCore::new(FiberId::next());
            core.complete(Exit::interrupt(FiberId::None), refs);
            return core;
        }
        let options = ForkOptions {
            refs,
            flags: RuntimeFlags::default(),
            scope: self.shared.global_scope.clone(),
            parent: None,
            forked_by: FiberId::None,
        };
        spawn(&self.shared, body, share, options)
    }

    /// Interrupt every root and daemon fiber, wait for them up to the
    /// configured timeout, then stop the worker and timer threads.
    /// Calling it again does nothing.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let timeout = shared.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        info!(
            fibers = shared.global_scope.len(),
            timeout_ms = timeout.as_millis() as u64,
            "runtime shutting down"
        );

        // The closer must not be registered in the scope it closes.
        let closing = shared.global_scope.close(Exit::interrupt(FiberId::None));
        let options = ForkOptions {
            refs: FiberRefs::empty(),
            flags: RuntimeFlags::default(),
            scope: Scope::new(),
            parent: None,
            forked_by: FiberId::None,
        };
        let closer = spawn(shared, closing.into_primitive(), share_value::<()>, options);
        if shared.scheduler.on_worker() {
            warn!("runtime shut down from one of its workers; not waiting for fibers");
        } else if wait_for(&closer, Some(timeout)).is_none() {
            warn!(timeout_ms = timeout.as_millis() as u64, "fibers still running at shutdown deadline");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = shared.scheduler.shutdown(remaining.max(Duration::from_millis(100)));
        if !shared.timer.shutdown(Duration::from_secs(1)) {
            warn!("timer thread did not stop");
        }
        info!("runtime stopped");
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "runtime shutdown failed");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.scheduler.num_workers())
            .field("stopped", &self.is_shutdown())
            .finish()
    }
}

/// Block the host thread until `core` is done.
fn wait_for(core: &FiberCore, timeout: Option<Duration>) -> Option<SharedExit> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    core.observe(Box::new(move |exit: &SharedExit| {
        let _ = tx.send(exit.clone());
    }));
    match timeout {
        Some(timeout) => rx.recv_timeout(timeout).ok(),
        None => rx.recv().ok(),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfigBuilder,
    init_logging: bool,
}

impl RuntimeBuilder {
    /// A builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config = self.config.num_workers(n);
        self
    }

    /// Set the evaluation budget per scheduling slice.
    pub fn ops_before_yield(mut self, ops: usize) -> Self {
        self.config = self.config.ops_before_yield(ops);
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config = self.config.work_stealing(enabled);
        self
    }

    /// Set how long an idle worker parks between polls.
    pub fn idle_park(mut self, park: Duration) -> Self {
        self.config = self.config.idle_park(park);
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.shutdown_timeout(timeout);
        self
    }

    /// Set the log level used by [`RuntimeBuilder::with_logging`].
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config = self.config.log_level(level);
        self
    }

    /// Install the fmt subscriber from [`crate::log::init`] when building.
    pub fn with_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    /// Validate the configuration and start the runtime.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config.build()?;
        if self.init_logging {
            crate::log::init(&config.log);
        }
        Runtime::new(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
