use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::PoisonError;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, debug_span, error, warn};

use crate::channel::core::PortCore;
use crate::channel::{MessageEvent, MessagePort, Transferable};
use crate::emitter::ListenerId;
use crate::error::{Result, WorkerError};
use crate::error_bridge::{Thrown, serialize_error};
use crate::message::ControlMessage;
use crate::runtime::{EventLoop, LoopHandle, ThreadId, Wake};
use crate::stdio::{ReadableStdio, WorkerStdio, WritableStdio};
use crate::worker::Runtime;
use crate::worker::controller::ExitSlot;

/// Everything a worker thread takes with it from the spawning thread.
pub(crate) struct ChildContext {
    pub(crate) thread_id: ThreadId,
    pub(crate) handle: LoopHandle,
    pub(crate) rx: UnboundedReceiver<Wake>,
    pub(crate) control: PortCore,
    pub(crate) runtime: Runtime,
    pub(crate) owner: LoopHandle,
    pub(crate) exit_slot: ExitSlot,
    pub(crate) exit_key: u64,
}

/// Body of every worker thread. Always reports an exit code to the owner,
/// even if the thread's own machinery panics.
pub(crate) fn run_child(ctx: ChildContext) {
    let ChildContext {
        thread_id,
        handle,
        rx,
        control,
        runtime,
        owner,
        exit_slot,
        exit_key,
    } = ctx;
    let span = debug_span!("worker", thread_id);
    let _entered = span.enter();

    let code = panic::catch_unwind(AssertUnwindSafe(|| {
        drive(thread_id, handle, rx, control, runtime)
    }))
    .unwrap_or_else(|_| {
        error!(thread_id, "worker thread panicked outside a callback");
        1
    });

    *exit_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    debug!(thread_id, code, "worker thread finished");
    owner.wake(Wake::Handle(exit_key));
}

fn drive(
    thread_id: ThreadId,
    handle: LoopHandle,
    rx: UnboundedReceiver<Wake>,
    control: PortCore,
    runtime: Runtime,
) -> i32 {
    let lp = EventLoop::from_parts(handle, rx);
    lp.install();

    let control = MessagePort::adopt(control, &lp);
    let scope = WorkerScope::new(thread_id, &lp, &control, runtime);

    let weak = scope.downgrade();
    lp.set_fatal_hook(move |thrown| {
        if let Some(scope) = weak.upgrade() {
            scope.fatal_exception(thrown);
        }
    });
    let handler_scope = scope.clone();
    control.set_handler(move |ev| handler_scope.on_control(ev));
    control.unref();

    lp.run();
    let code = lp.exit_code();
    scope.teardown();
    lp.uninstall();
    code
}

type UncaughtHandler = Rc<dyn Fn(&Thrown) -> bool>;

struct ScopeInner {
    thread_id: ThreadId,
    lp: EventLoop,
    control: MessagePort,
    runtime: Runtime,
    public: RefCell<Option<MessagePort>>,
    stdio: WorkerStdio,
    worker_data: RefCell<Value>,
    loaded: Cell<bool>,
    uncaught: RefCell<Vec<UncaughtHandler>>,
}

/// What a running script sees of its worker thread.
#[derive(Clone)]
pub struct WorkerScope {
    inner: Rc<ScopeInner>,
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScope")
            .field("thread_id", &self.inner.thread_id)
            .finish_non_exhaustive()
    }
}

impl WorkerScope {
    fn new(thread_id: ThreadId, lp: &EventLoop, control: &MessagePort, runtime: Runtime) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                thread_id,
                lp: lp.clone(),
                control: control.clone(),
                runtime,
                public: RefCell::new(None),
                // stdin end-of-stream is pushed on load when the owner gave none
                stdio: WorkerStdio::new(control, true),
                worker_data: RefCell::new(Value::Null),
                loaded: Cell::new(false),
                uncaught: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub fn is_main_thread(&self) -> bool {
        self.inner.lp.is_main_thread()
    }

    /// Copy of the data the owner passed in `WorkerOptions::worker_data`.
    pub fn worker_data(&self) -> Value {
        self.inner.worker_data.borrow().clone()
    }

    /// This thread's end of the public channel.
    pub fn parent_port(&self) -> Option<MessagePort> {
        self.inner.public.borrow().clone()
    }

    pub fn stdin(&self) -> ReadableStdio {
        self.inner.stdio.stdin.clone()
    }

    pub fn stdout(&self) -> WritableStdio {
        self.inner.stdio.stdout.clone()
    }

    pub fn stderr(&self) -> WritableStdio {
        self.inner.stdio.stderr.clone()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }

    pub fn post_message(&self, data: Value, transfer: Vec<Transferable>) -> Result<bool> {
        match self.parent_port() {
            Some(port) => port.post_message(data, transfer),
            None => Err(WorkerError::Detached),
        }
    }

    pub fn post(&self, value: impl Serialize) -> Result<bool> {
        self.post_message(serde_json::to_value(value)?, Vec::new())
    }

    /// Listens on the parent port. The thread stays alive while any listener is attached.
    pub fn on_message(&self, listener: impl Fn(&MessageEvent) + 'static) -> Result<ListenerId> {
        let port = self.parent_port().ok_or(WorkerError::Detached)?;
        Ok(port.on_message(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.parent_port().is_some_and(|port| port.off(id))
    }

    /// Local recovery hook, tried before a failure crosses to the owner.
    /// Returning `true` marks the failure handled and the thread keeps running.
    pub fn on_uncaught(&self, handler: impl Fn(&Thrown) -> bool + 'static) {
        self.inner.uncaught.borrow_mut().push(Rc::new(handler));
    }

    /// Stops the thread before its next callback with `code` as exit code.
    pub fn exit(&self, code: i32) {
        debug!(thread_id = self.inner.thread_id, code, "worker exit requested");
        self.inner.lp.request_exit(code);
    }

    /// Set once the owner called `terminate` (or the thread is already exiting).
    pub fn is_terminating(&self) -> bool {
        self.inner.lp.handle().is_stopping()
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
        match msg {
            ControlMessage::Load {
                target,
                eval,
                worker_data,
                public_port,
                has_stdin,
            } => self.load(&ev.ports, &target, eval, worker_data, public_port, has_stdin),
            other => self.protocol_violation(WorkerError::ProtocolViolation(format!(
                "unexpected `{}` from owner",
                other.kind()
            ))),
        }
    }

    fn load(
        &self,
        ports: &[MessagePort],
        target: &str,
        eval: bool,
        worker_data: Value,
        public_port: usize,
        has_stdin: bool,
    ) {
        let inner = &self.inner;
        if inner.loaded.replace(true) {
            return self.protocol_violation(WorkerError::ProtocolViolation(
                "received a second load".into(),
            ));
        }
        let Some(port) = ports.get(public_port).cloned() else {
            return self.protocol_violation(WorkerError::ProtocolViolation(format!(
                "load names port {public_port} but carries {}",
                ports.len()
            )));
        };
        *inner.public.borrow_mut() = Some(port);
        *inner.worker_data.borrow_mut() = worker_data;
        if !has_stdin {
            inner.stdio.stdin.push(None);
        }
        if let Err(err) = self.send_control(&ControlMessage::Ready) {
            warn!(thread_id = inner.thread_id, %err, "could not report readiness");
        }

        debug!(thread_id = inner.thread_id, target, eval, "running worker script");
        let loader = inner.runtime.loader().clone();
        if let Err(thrown) = loader.execute(target, eval, self) {
            self.fatal_exception(thrown);
        }
    }

    fn send_control(&self, msg: &ControlMessage) -> Result<bool> {
        self.inner.control.post_message(msg.encode()?, Vec::new())
    }

    fn protocol_violation(&self, err: WorkerError) {
        error!(thread_id = self.inner.thread_id, %err, "bad control message from owner");
        // not offered to `on_uncaught`: a broken control channel is never recoverable
        self.report_fatal(Thrown::from(err));
    }

    /// Uncaught failure: local handlers first, then report to the owner and
    /// stop with exit code 1.
    pub(crate) fn fatal_exception(&self, thrown: Thrown) {
        let inner = &self.inner;
        let handlers: Vec<UncaughtHandler> = inner.uncaught.borrow().clone();
        if handlers.iter().any(|handler| handler(&thrown)) {
            debug!(thread_id = inner.thread_id, "uncaught failure handled locally");
            return;
        }
        self.report_fatal(thrown);
    }

    /// Sends the failure to the owner, drops pending work and stops with exit code 1.
    fn report_fatal(&self, thrown: Thrown) {
        let inner = &self.inner;
        debug!(thread_id = inner.thread_id, ?thrown, "fatal exception");
        let msg = match serialize_error(&thrown) {
            Ok(error) => ControlMessage::ErrorMessage { error },
            Err(err) => {
                debug!(thread_id = inner.thread_id, %err, "sending unserializable error");
                ControlMessage::UnserializableError
            }
        };
        if let Err(err) = self.send_control(&msg) {
            error!(thread_id = inner.thread_id, %err, "could not report fatal exception");
        }
        inner.lp.clear_local_queue();
        inner.lp.request_exit(1);
    }

    /// Runs after the loop stopped: flush stdio and hang up both channels.
    fn teardown(&self) {
        let inner = &self.inner;
        for stream in [&inner.stdio.stdout, &inner.stdio.stderr] {
            if let Err(err) = stream.end() {
                warn!(thread_id = inner.thread_id, %err, "could not end {}", stream.stream());
            }
        }
        if let Some(public) = inner.public.borrow_mut().take() {
            public.close();
        }
        inner.control.close();
        inner.uncaught.borrow_mut().clear();
    }
}

/// Weak handle for callbacks that must not keep a scope alive.
pub(crate) struct WeakScope(Weak<ScopeInner>);

impl WeakScope {
    pub(crate) fn upgrade(&self) -> Option<WorkerScope> {
        self.0.upgrade().map(|inner| WorkerScope { inner })
    }
}

impl WorkerScope {
    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope(Rc::downgrade(&self.inner))
    }
}
