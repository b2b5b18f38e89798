//! Worker threads.
//!
//! [`Runtime::spawn`] starts a thread running a script from the configured
//! [`ScriptLoader`] and returns a [`Worker`] handle bound to the calling
//! thread's event loop. Coordination between the two sides runs over a
//! private control channel; user messages use a separate public channel
//! whose far end the script sees through [`WorkerScope::parent_port`].
//!
//! ```text
//!  owner thread                               worker thread
//!  Worker ── control port ◀── Ready/Stdio*/Error* ── WorkerScope
//!         ──────────────── Load{public port} ──────▶
//!  Worker ── public port  ◀────── user messages ───▶ parent_port()
//! ```

mod child;
mod controller;

use std::sync::Arc;

use serde_json::Value;

pub use child::WorkerScope;
pub use controller::{ThreadState, Worker, WorkerEvent, WorkerEventName};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::loader::ScriptLoader;

/// Per-worker options.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Treat the target as a registered script name instead of a path.
    pub eval: bool,
    /// Give the owner a writable stdin for the worker. Without it the
    /// worker's stdin reports end-of-stream right away.
    pub stdin: bool,
    /// Keep stdout for the owner to read instead of forwarding it.
    pub stdout: bool,
    pub stderr: bool,
    pub worker_data: Value,
    /// Thread name override.
    pub name: Option<String>,
}

impl WorkerOptions {
    pub fn eval() -> Self {
        Self {
            eval: true,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.worker_data = data;
        self
    }
}

struct RuntimeShared {
    loader: Arc<dyn ScriptLoader>,
    config: RuntimeConfig,
}

/// Loader and settings shared by a tree of workers. Cheap to clone and `Send`,
/// so scripts can spawn nested workers from their own threads.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(loader: impl ScriptLoader + 'static, config: RuntimeConfig) -> Self {
        Self::with_loader(Arc::new(loader), config)
    }

    pub fn with_loader(loader: Arc<dyn ScriptLoader>, config: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(RuntimeShared { loader, config }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn loader(&self) -> &Arc<dyn ScriptLoader> {
        &self.shared.loader
    }

    /// Starts a worker owned by the current thread's event loop.
    ///
    /// Fails synchronously with a configuration error if `target` is not
    /// addressable; nothing is spawned in that case.
    pub fn spawn(&self, target: &str, options: WorkerOptions) -> Result<Worker> {
        Worker::spawn(self, target, options)
    }
}
