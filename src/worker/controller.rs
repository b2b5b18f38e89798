use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, warn};

use crate::channel::core::ChannelCore;
use crate::channel::{MessageChannel, MessageEvent, MessagePort, Transferable, track_interest};
use crate::config::RuntimeConfig;
use crate::emitter::{Emitter, Event, ListenerId};
use crate::error::{Result, WorkerError};
use crate::error_bridge::{ErrorEvent, deserialize_error};
use crate::message::ControlMessage;
use crate::runtime::{EventLoop, LoopHandle, ThreadId, Wakeable, next_handle_id, next_thread_id};
use crate::stdio::{ParentStdio, ReadableStdio, WritableStdio};
use crate::worker::child::{ChildContext, run_child};
use crate::worker::{Runtime, WorkerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ThreadState {
    Starting,
    Running,
    Exiting,
    Disposed,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Online,
    Message(MessageEvent),
    Error(ErrorEvent),
    Exit(i32),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum WorkerEventName {
    Online,
    Message,
    Error,
    Exit,
    Close,
}

impl Event for WorkerEvent {
    type Name = WorkerEventName;

    fn name(&self) -> WorkerEventName {
        match self {
            WorkerEvent::Online => WorkerEventName::Online,
            WorkerEvent::Message(_) => WorkerEventName::Message,
            WorkerEvent::Error(_) => WorkerEventName::Error,
            WorkerEvent::Exit(_) => WorkerEventName::Exit,
            WorkerEvent::Close => WorkerEventName::Close,
        }
    }
}

/// Exit code handed over by the worker thread right before it finishes.
pub(crate) type ExitSlot = Arc<Mutex<Option<i32>>>;

struct WorkerInner {
    thread_id: ThreadId,
    lp: EventLoop,
    remote: LoopHandle,
    state: Cell<ThreadState>,
    control: RefCell<Option<MessagePort>>,
    public: RefCell<Option<MessagePort>>,
    stdio: ParentStdio,
    exit_slot: ExitSlot,
    exit_key: u64,
    thread_ref: Cell<bool>,
    join: RefCell<Option<JoinHandle<()>>>,
    events: Emitter<WorkerEvent>,
}

/// Owner-side handle of a worker thread.
///
/// Lives on the thread that spawned it; every signal is delivered on that
/// thread's event loop. Signals stop after "exit".
#[derive(Clone)]
pub struct Worker {
    inner: Rc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("thread_id", &self.inner.thread_id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

/// Pinned on the owner loop until the exit is handled, so a running worker
/// is seen through even when every `Worker` handle was dropped.
struct ExitWatcher {
    worker: Rc<WorkerInner>,
}

impl Wakeable for ExitWatcher {
    fn on_wake(self: Rc<Self>) {
        let inner = self.worker.clone();
        let code = inner
            .exit_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match code {
            Some(code) => Worker { inner }.handle_exit(code),
            None => warn!(thread_id = inner.thread_id, "exit wake-up without an exit code"),
        }
    }
}

impl Worker {
    pub(crate) fn spawn(runtime: &Runtime, target: &str, options: WorkerOptions) -> Result<Self> {
        let lp = EventLoop::current()?;
        let resolved = runtime.loader().resolve(target, options.eval)?;
        let config = runtime.config();
        let thread_id = next_thread_id();
        debug!(thread_id, target, %resolved, "creating worker");

        let (control_local, control_remote) = ChannelCore::pair();
        let control = MessagePort::adopt(control_local, &lp);
        let stdio = ParentStdio::new(&control, options.stdin);
        let public = MessageChannel::new()?;
        let (remote, remote_rx) = LoopHandle::pair(thread_id);

        let worker = Worker {
            inner: Rc::new(WorkerInner {
                thread_id,
                lp: lp.clone(),
                remote: remote.clone(),
                state: Cell::new(ThreadState::Starting),
                control: RefCell::new(Some(control.clone())),
                public: RefCell::new(Some(public.port1.clone())),
                stdio,
                exit_slot: Arc::new(Mutex::new(None)),
                exit_key: next_handle_id(),
                thread_ref: Cell::new(false),
                join: RefCell::new(None),
                events: Emitter::new(),
            }),
        };

        let weak = Rc::downgrade(&worker.inner);
        control.set_handler(move |ev| {
            if let Some(inner) = weak.upgrade() {
                Worker { inner }.on_control(ev);
            }
        });
        // control traffic alone never keeps the owner alive; stdio demand refs it when needed
        control.unref();

        let weak = Rc::downgrade(&worker.inner);
        public.port1.set_handler(move |ev| {
            if let Some(inner) = weak.upgrade() {
                inner.events.emit(&WorkerEvent::Message(ev.clone()));
            }
        });
        track_interest(&public.port1, &worker.inner.events, WorkerEventName::Message);
        let weak = Rc::downgrade(&worker.inner);
        public.port1.on_close(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.state.get() != ThreadState::Disposed {
                    inner.events.emit(&WorkerEvent::Close);
                }
            }
        });

        let load = ControlMessage::Load {
            target: resolved,
            eval: options.eval,
            worker_data: options.worker_data,
            public_port: 0,
            has_stdin: options.stdin,
        };
        control.post_message(load.encode()?, vec![Transferable::Port(public.port2)])?;
        worker.wire_default_stdio(options.stdout, options.stderr, config);

        let ctx = ChildContext {
            thread_id,
            handle: remote,
            rx: remote_rx,
            control: control_remote,
            runtime: runtime.clone(),
            owner: lp.handle(),
            exit_slot: worker.inner.exit_slot.clone(),
            exit_key: worker.inner.exit_key,
        };
        let name = options
            .name
            .unwrap_or_else(|| format!("{}-{thread_id}", config.thread_name_prefix));
        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        let join = match builder.spawn(move || run_child(ctx)) {
            Ok(join) => join,
            Err(err) => {
                error!(thread_id, %err, "failed to start worker thread");
                worker.dispose();
                worker.inner.state.set(ThreadState::Disposed);
                return Err(WorkerError::ThreadSpawn(err));
            }
        };
        *worker.inner.join.borrow_mut() = Some(join);

        let watcher: Rc<dyn Wakeable> = Rc::new(ExitWatcher {
            worker: worker.inner.clone(),
        });
        lp.pin(worker.inner.exit_key, watcher);
        worker.inner.thread_ref.set(true);
        lp.ref_handle();
        Ok(worker)
    }

    /// Unconfigured output streams go to the owner's own stdout/stderr and
    /// never hold the owner alive.
    fn wire_default_stdio(&self, stdout: bool, stderr: bool, config: &RuntimeConfig) {
        let stdio = &self.inner.stdio;
        if !stdout {
            stdio.stdout.set_increments_ref(false);
            if config.forward_inherited_stdio {
                stdio.stdout.pipe_to(io::stdout());
            } else {
                stdio.stdout.pipe_to(io::sink());
            }
        }
        if !stderr {
            stdio.stderr.set_increments_ref(false);
            if config.forward_inherited_stdio {
                stdio.stderr.pipe_to(io::stderr());
            } else {
                stdio.stderr.pipe_to(io::sink());
            }
        }
    }

    fn on_control(&self, ev: &MessageEvent) {
        let msg = match ControlMessage::decode(&ev.data) {
            Ok(msg) => msg,
            Err(err) => return self.protocol_violation(err),
        };
        match self.inner.stdio.route(&msg) {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => return self.protocol_violation(err),
        }
        let thread_id = self.inner.thread_id;
        match msg {
            ControlMessage::Ready => {
                if self.inner.state.get() == ThreadState::Starting {
                    debug!(thread_id, "worker is online");
                    self.inner.state.set(ThreadState::Running);
                    self.inner.events.emit(&WorkerEvent::Online);
                }
            }
            ControlMessage::ErrorMessage { error } => {
                let event = match deserialize_error(&error) {
                    Ok(remote) => ErrorEvent::Thrown(remote),
                    Err(err) => {
                        warn!(thread_id, %err, "could not decode worker error");
                        ErrorEvent::Unserializable
                    }
                };
                debug!(thread_id, "worker reported an uncaught error");
                self.inner.events.emit(&WorkerEvent::Error(event));
            }
            ControlMessage::UnserializableError => {
                debug!(thread_id, "worker reported an unserializable error");
                self.inner
                    .events
                    .emit(&WorkerEvent::Error(ErrorEvent::Unserializable));
            }
            other => self.protocol_violation(WorkerError::ProtocolViolation(format!(
                "unexpected `{}` from worker",
                other.kind()
            ))),
        }
    }

    fn protocol_violation(&self, err: WorkerError) {
        error!(thread_id = self.inner.thread_id, %err, "closing control channel");
        if let Some(control) = self.inner.control.borrow_mut().take() {
            control.close();
        }
        self.inner.remote.stop();
    }

    fn handle_exit(&self, code: i32) {
        let inner = &self.inner;
        if matches!(inner.state.get(), ThreadState::Exiting | ThreadState::Disposed) {
            return;
        }
        debug!(thread_id = inner.thread_id, code, "worker exited");
        inner.state.set(ThreadState::Exiting);
        if let Some(join) = inner.join.borrow_mut().take() {
            if join.join().is_err() {
                warn!(thread_id = inner.thread_id, "worker thread panicked during teardown");
            }
        }

        // messages that arrived before the exit notification still go out first
        let public = inner.public.borrow().clone();
        if let Some(public) = public {
            public.drain();
        }
        let control = inner.control.borrow().clone();
        if let Some(control) = control {
            control.drain();
        }
        inner.events.remove_listeners(WorkerEventName::Message);

        self.dispose();
        inner.events.emit(&WorkerEvent::Exit(code));
        inner.events.remove_all();
        inner.state.set(ThreadState::Disposed);
    }

    fn dispose(&self) {
        let inner = &self.inner;
        if inner.thread_ref.replace(false) {
            inner.lp.unref_handle();
        }
        inner.lp.unregister(inner.exit_key);
        if let Some(public) = inner.public.borrow_mut().take() {
            public.close();
        }
        if let Some(control) = inner.control.borrow_mut().take() {
            control.close();
        }
        inner.stdio.stdout.finish();
        inner.stdio.stderr.finish();
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        match self.inner.state.get() {
            ThreadState::Disposed => None,
            _ => Some(self.inner.thread_id),
        }
    }

    pub fn state(&self) -> ThreadState {
        self.inner.state.get()
    }

    /// Present only when spawned with `stdin: true`.
    pub fn stdin(&self) -> Option<WritableStdio> {
        self.inner.stdio.stdin.clone()
    }

    pub fn stdout(&self) -> ReadableStdio {
        self.inner.stdio.stdout.clone()
    }

    pub fn stderr(&self) -> ReadableStdio {
        self.inner.stdio.stderr.clone()
    }

    /// Sends to the worker's parent port. `Ok(false)` once the worker is gone.
    pub fn post_message(&self, data: Value, transfer: Vec<Transferable>) -> Result<bool> {
        let public = self.inner.public.borrow().clone();
        match public {
            Some(port) => port.post_message(data, transfer),
            None => Ok(false),
        }
    }

    pub fn post(&self, value: impl Serialize) -> Result<bool> {
        self.post_message(serde_json::to_value(value)?, Vec::new())
    }

    pub fn terminate(&self) {
        self.terminate_with(|_| {});
    }

    /// Asks the worker thread to stop before its next callback. `on_done`
    /// receives the exit code. Does nothing once the worker is disposed.
    ///
    /// The stop is only observed between callbacks: a callback that never
    /// returns cannot be interrupted. Long-running scripts should poll
    /// [`WorkerScope::is_terminating`](crate::WorkerScope::is_terminating).
    pub fn terminate_with(&self, on_done: impl FnOnce(i32) + 'static) {
        if self.inner.state.get() == ThreadState::Disposed {
            return;
        }
        debug!(thread_id = self.inner.thread_id, "terminating worker");
        let on_done = RefCell::new(Some(on_done));
        self.inner.events.once(WorkerEventName::Exit, move |ev| {
            if let (WorkerEvent::Exit(code), Some(f)) = (ev, on_done.borrow_mut().take()) {
                f(*code);
            }
        });
        self.inner.remote.stop();
    }

    /// Keeps the owner loop alive until the worker exits.
    pub fn ref_(&self) {
        if self.inner.state.get() == ThreadState::Disposed {
            return;
        }
        if !self.inner.thread_ref.replace(true) {
            self.inner.lp.ref_handle();
        }
        if let Some(public) = self.inner.public.borrow().as_ref() {
            public.ref_();
        }
    }

    pub fn unref(&self) {
        if self.inner.thread_ref.replace(false) {
            self.inner.lp.unref_handle();
        }
        if let Some(public) = self.inner.public.borrow().as_ref() {
            public.unref();
        }
    }

    pub fn has_ref(&self) -> bool {
        self.inner.thread_ref.get()
    }

    pub fn on(&self, name: WorkerEventName, listener: impl Fn(&WorkerEvent) + 'static) -> ListenerId {
        self.inner.events.on(name, listener)
    }

    pub fn once(
        &self,
        name: WorkerEventName,
        listener: impl Fn(&WorkerEvent) + 'static,
    ) -> ListenerId {
        self.inner.events.once(name, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    pub fn on_online(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.on(WorkerEventName::Online, move |_| listener())
    }

    pub fn on_message(&self, listener: impl Fn(&MessageEvent) + 'static) -> ListenerId {
        self.on(WorkerEventName::Message, move |ev| {
            if let WorkerEvent::Message(msg) = ev {
                listener(msg);
            }
        })
    }

    pub fn on_error(&self, listener: impl Fn(&ErrorEvent) + 'static) -> ListenerId {
        self.on(WorkerEventName::Error, move |ev| {
            if let WorkerEvent::Error(err) = ev {
                listener(err);
            }
        })
    }

    pub fn on_exit(&self, listener: impl Fn(i32) + 'static) -> ListenerId {
        self.on(WorkerEventName::Exit, move |ev| {
            if let WorkerEvent::Exit(code) = ev {
                listener(*code);
            }
        })
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.on(WorkerEventName::Close, move |_| listener())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::RegistryLoader;
    use serde_json::json;

    fn quiet_runtime(register: impl FnOnce(&RegistryLoader)) -> Runtime {
        let config = RuntimeConfig {
            forward_inherited_stdio: false,
            ..RuntimeConfig::default()
        };
        let loader = RegistryLoader::from_config(&config);
        register(&loader);
        Runtime::new(loader, config)
    }

    #[test]
    fn test_bad_control_message_is_fatal_even_with_local_recovery() {
        let runtime = quiet_runtime(|loader| {
            loader.register_eval("stubborn", |scope| {
                scope.on_uncaught(|_| true);
                // keeps the worker alive on its own
                scope.on_message(|_| {})?;
                Ok(())
            });
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        EventLoop::run_main(move || {
            let worker = runtime.spawn("stubborn", WorkerOptions::eval()).unwrap();
            let w = worker.clone();
            worker.on_online(move || {
                let control = w.inner.control.borrow().clone().unwrap();
                control
                    .post_message(json!({"type": "bogus"}), Vec::new())
                    .unwrap();
            });
            let s1 = s.clone();
            worker.on_error(move |err| {
                let text = match err {
                    ErrorEvent::Thrown(remote) => remote.message().unwrap_or_default().to_string(),
                    ErrorEvent::Unserializable => "unserializable".to_string(),
                };
                s1.borrow_mut().push(text);
            });
            worker.on_exit(move |code| s.borrow_mut().push(format!("exit {code}")));
        })
        .unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2, "{seen:?}");
        assert!(seen[0].contains("protocol violation"), "{seen:?}");
        assert_eq!(seen[1], "exit 1");
    }

    #[test]
    fn test_terminate_after_dispose_is_a_no_op() {
        let runtime = quiet_runtime(|loader| {
            loader.register_eval("noop", |_| Ok(()));
        });
        let exits = Rc::new(Cell::new(0));
        let e = exits.clone();
        let handle = Rc::new(RefCell::new(None));
        let h = handle.clone();
        EventLoop::run_main(move || {
            let worker = runtime.spawn("noop", WorkerOptions::eval()).unwrap();
            worker.on_exit(move |_| e.set(e.get() + 1));
            *h.borrow_mut() = Some(worker);
        })
        .unwrap();
        let worker = handle.borrow_mut().take().unwrap();
        assert_eq!(worker.state(), ThreadState::Disposed);
        assert_eq!(worker.thread_id(), None);
        worker.terminate();
        assert_eq!(exits.get(), 1);
    }
}
