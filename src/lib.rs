pub mod channel;
pub mod config;
pub mod emitter;
pub mod error;
pub mod error_bridge;
pub mod loader;
pub mod logger;
pub mod message;
pub mod runtime;
pub mod stdio;
pub mod worker;

pub use channel::{MessageChannel, MessageEvent, MessagePort, SharedRef, Transferable};
pub use config::RuntimeConfig;
pub use error::{ConfigurationError, Result, WorkerError};
pub use error_bridge::{ErrorEvent, ErrorLike, RemoteError, Thrown};
pub use loader::{RegistryLoader, Script, ScriptLoader};
pub use runtime::{EventLoop, LoopHandle, MAIN_THREAD_ID, ThreadId};
pub use worker::{
    Runtime, ThreadState, Worker, WorkerEvent, WorkerEventName, WorkerOptions, WorkerScope,
};
