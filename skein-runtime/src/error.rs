//! Host-side runtime errors.
//!
//! Failures of the programs a runtime runs are values (see
//! [`Cause`](crate::Cause)); the errors here concern the runtime itself.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Error constructing or stopping a [`Runtime`](crate::Runtime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker or timer thread could not be spawned.
    #[error("failed to spawn runtime thread '{name}': {source}")]
    WorkerSpawn {
        /// Name of the thread.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Shutdown timed out with threads still running.
    #[error("shutdown timed out with {unfinished} thread(s) still running")]
    Shutdown {
        /// Threads that had not exited by the deadline.
        unfinished: usize,
    },
}
