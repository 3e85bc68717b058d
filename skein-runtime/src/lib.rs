//! # Skein Runtime Library
//!
//! A structured-concurrency effect runtime:
//!
//! - **Effects**: immutable descriptions of computations, run by a
//!   stack-safe trampoline interpreter
//! - **Fibers**: lightweight threads with supervision, interruption and
//!   per-fiber references
//! - **Scopes**: finalizer registries closed exactly once, newest first
//! - **Coordination**: bounded queues with back-pressure, sliding and
//!   dropping strategies, and one-shot deferred cells
//! - **Scheduler**: M:N cooperative scheduling with work-stealing
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: Based on Chase-Lev deque per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Failure model**: failures are values ([`Cause`], [`Exit`]); typed
//!   failures, defects and interruptions compose sequentially and in
//!   parallel
//! - **Logging**: structured events per [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SKEIN RUNTIME                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │    Queue     │  │   Deferred   │          │
//! │  │ (effect/*.rs)│  │  (queue.rs)  │  │(deferred.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Interpreter  │  │    Fiber     │  │    Scope     │          │
//! │  │(interpreter) │  │  (fiber.rs)  │  │  (scope.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                                   │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Scheduler   │  │    Timer     │  │   Runtime    │          │
//! │  │(scheduler.rs)│  │  (timer.rs)  │  │ (runtime.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use skein_runtime::{Effect, Exit, Runtime};
//!
//! let rt = Runtime::builder().num_workers(2).build().unwrap();
//! let slow = Effect::<()>::sleep(Duration::from_millis(50)).as_value("slow");
//! let fast = Effect::succeed("fast");
//! assert_eq!(rt.run_blocking(slow.race(fast)), Exit::Success("fast"));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod log;

mod cause;
mod deferred;
mod effect;
mod error;
mod exit;
mod fiber;
mod fiber_id;
mod fiber_ref;
mod flags;
mod interpreter;
mod queue;
mod runtime;
mod scheduler;
mod scope;
mod timer;

// Re-exports
pub use cause::{AnyError, Cause, Defect, Link};
pub use config::{ConfigError, LogConfig, LogLevel, RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig};
pub use deferred::Deferred;
pub use effect::{AsyncCallback, Effect, EffectError, Restore};
pub use error::RuntimeError;
pub use exit::Exit;
pub use fiber::{Fiber, FiberStatus};
pub use fiber_id::FiberId;
pub use fiber_ref::{FiberRef, FiberRefs};
pub use flags::{FlagsPatch, RuntimeFlags};
pub use queue::{Queue, Strategy};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scope::{Finalizer, FinalizerKey, Scope, ScopeExit};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
