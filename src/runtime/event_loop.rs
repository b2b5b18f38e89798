use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::error::{Result, WorkerError};
use crate::error_bridge::Thrown;

pub type ThreadId = u64;

/// Id of the thread that owns the first loop, i.e. the one not spawned as a worker.
pub const MAIN_THREAD_ID: ThreadId = 0;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_thread_id() -> ThreadId {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Wake-ups other threads can post into a loop's inbox.
pub(crate) enum Wake {
    /// A handle registered under this key has pending work.
    Handle(u64),
    Call(Box<dyn FnOnce() + Send>),
    Stop,
}

/// Thread-local object a [`Wake::Handle`] is routed to.
pub(crate) trait Wakeable {
    fn on_wake(self: Rc<Self>);
}

enum WakeTarget {
    Weak(Weak<dyn Wakeable>),
    Pinned(Rc<dyn Wakeable>),
}

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// Cross-thread reference to a loop. Cheap to clone, `Send`.
#[derive(Clone, Debug)]
pub struct LoopHandle {
    thread_id: ThreadId,
    tx: UnboundedSender<Wake>,
    stopping: Arc<AtomicBool>,
}

impl std::fmt::Debug for Wake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Wake::Handle(key) => write!(f, "Handle({key})"),
            Wake::Call(_) => f.write_str("Call"),
            Wake::Stop => f.write_str("Stop"),
        }
    }
}

impl LoopHandle {
    pub(crate) fn pair(thread_id: ThreadId) -> (Self, UnboundedReceiver<Wake>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            thread_id,
            tx,
            stopping: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Returns false once the loop is gone.
    pub(crate) fn wake(&self, wake: Wake) -> bool {
        self.tx.send(wake).is_ok()
    }

    /// Runs `f` on the loop's thread as its own callback.
    pub fn call(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.wake(Wake::Call(Box::new(f)))
    }

    /// Forced stop: the loop leaves before its next callback, whatever it holds.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Wake::Stop);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

struct LoopInner {
    handle: LoopHandle,
    rx: RefCell<UnboundedReceiver<Wake>>,
    local: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    refs: Cell<usize>,
    targets: RefCell<HashMap<u64, WakeTarget>>,
    fatal_hook: RefCell<Option<Rc<dyn Fn(Thrown)>>>,
    exit_code: Cell<Option<i32>>,
}

/// Single-threaded scheduler owned by the current thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    pub(crate) fn from_parts(handle: LoopHandle, rx: UnboundedReceiver<Wake>) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                handle,
                rx: RefCell::new(rx),
                local: RefCell::new(VecDeque::new()),
                refs: Cell::new(0),
                targets: RefCell::new(HashMap::new()),
                fatal_hook: RefCell::new(None),
                exit_code: Cell::new(None),
            }),
        }
    }

    /// The loop running on this thread.
    pub fn current() -> Result<Self> {
        Self::try_current().ok_or(WorkerError::Detached)
    }

    pub fn try_current() -> Option<Self> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Installs a main-thread loop, runs `setup` inside it and then keeps
    /// scheduling until nothing holds the loop alive any more.
    ///
    /// Must not be called from inside an async runtime: an idle loop parks
    /// the thread on its inbox.
    pub fn run_main<R>(setup: impl FnOnce() -> R) -> Result<R> {
        if Self::try_current().is_some() {
            return Err(WorkerError::ProtocolViolation(
                "an event loop is already running on this thread".into(),
            ));
        }
        let (handle, rx) = LoopHandle::pair(MAIN_THREAD_ID);
        let lp = Self::from_parts(handle, rx);
        lp.install();
        let out = setup();
        lp.run();
        lp.uninstall();
        Ok(out)
    }

    pub(crate) fn install(&self) {
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
    }

    pub(crate) fn uninstall(&self) {
        let current = CURRENT.with(|c| c.borrow_mut().take());
        let targets = std::mem::take(&mut *self.inner.targets.borrow_mut());
        let tasks = std::mem::take(&mut *self.inner.local.borrow_mut());
        let hook = self.inner.fatal_hook.borrow_mut().take();
        drop((targets, tasks, hook, current));
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.handle.thread_id
    }

    pub fn is_main_thread(&self) -> bool {
        self.thread_id() == MAIN_THREAD_ID
    }

    pub fn handle(&self) -> LoopHandle {
        self.inner.handle.clone()
    }

    pub fn ref_handle(&self) {
        self.inner.refs.set(self.inner.refs.get() + 1);
    }

    pub fn unref_handle(&self) {
        self.inner.refs.set(self.inner.refs.get().saturating_sub(1));
    }

    /// Number of handles currently keeping this loop alive.
    pub fn refs(&self) -> usize {
        self.inner.refs.get()
    }

    pub fn queue_local(&self, task: impl FnOnce() + 'static) {
        self.inner.local.borrow_mut().push_back(Box::new(task));
    }

    /// Drops every queued local task; used when a thread tears down after a fatal failure.
    pub(crate) fn clear_local_queue(&self) {
        let dropped = std::mem::take(&mut *self.inner.local.borrow_mut());
        drop(dropped);
    }

    // Replaced and removed targets are dropped outside the borrow: dropping
    // one may unregister others.
    pub(crate) fn register(&self, key: u64, target: Weak<dyn Wakeable>) {
        let old = self
            .inner
            .targets
            .borrow_mut()
            .insert(key, WakeTarget::Weak(target));
        drop(old);
    }

    /// Like [`register`](Self::register) but the loop holds the target until unregistered.
    pub(crate) fn pin(&self, key: u64, target: Rc<dyn Wakeable>) {
        let old = self
            .inner
            .targets
            .borrow_mut()
            .insert(key, WakeTarget::Pinned(target));
        drop(old);
    }

    pub(crate) fn unregister(&self, key: u64) {
        let removed = self.inner.targets.borrow_mut().remove(&key);
        drop(removed);
    }

    pub(crate) fn set_fatal_hook(&self, hook: impl Fn(Thrown) + 'static) {
        *self.inner.fatal_hook.borrow_mut() = Some(Rc::new(hook));
    }

    /// Records `code` (first one wins) and stops the loop.
    pub fn request_exit(&self, code: i32) {
        if self.inner.exit_code.get().is_none() {
            self.inner.exit_code.set(Some(code));
        }
        self.inner.handle.stop();
    }

    /// Exit disposition after [`run`](Self::run) returns: an explicit code,
    /// 1 after a forced stop, 0 when the loop went idle.
    pub fn exit_code(&self) -> i32 {
        match self.inner.exit_code.get() {
            Some(code) => code,
            None if self.inner.handle.is_stopping() => 1,
            None => 0,
        }
    }

    /// Runs until stopped, or until idle with no keep-alive refs left.
    pub fn run(&self) {
        debug!(thread_id = self.thread_id(), "event loop running");
        loop {
            if self.inner.handle.is_stopping() {
                break;
            }
            let task = self.inner.local.borrow_mut().pop_front();
            if let Some(task) = task {
                self.run_guarded(task);
                continue;
            }
            let ready = self.inner.rx.borrow_mut().try_recv();
            if let Ok(wake) = ready {
                self.dispatch(wake);
                continue;
            }
            if self.inner.refs.get() == 0 {
                break;
            }
            let next = self.inner.rx.borrow_mut().blocking_recv();
            match next {
                Some(wake) => self.dispatch(wake),
                None => break,
            }
        }
        debug!(
            thread_id = self.thread_id(),
            refs = self.inner.refs.get(),
            "event loop finished"
        );
    }

    fn dispatch(&self, wake: Wake) {
        trace!(thread_id = self.thread_id(), ?wake, "dispatch");
        match wake {
            Wake::Handle(key) => {
                let target = match self.inner.targets.borrow().get(&key) {
                    Some(WakeTarget::Weak(weak)) => weak.upgrade(),
                    Some(WakeTarget::Pinned(rc)) => Some(rc.clone()),
                    None => None,
                };
                if let Some(target) = target {
                    self.run_guarded(move || target.on_wake());
                }
            }
            Wake::Call(f) => self.run_guarded(f),
            Wake::Stop => {}
        }
    }

    fn run_guarded(&self, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            let hook = self.inner.fatal_hook.borrow().clone();
            match hook {
                Some(hook) => hook(Thrown::from_panic(payload)),
                None => panic::resume_unwind(payload),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_loop_returns_immediately() {
        let id = EventLoop::run_main(|| EventLoop::current().unwrap().thread_id()).unwrap();
        assert_eq!(id, MAIN_THREAD_ID);
        assert!(EventLoop::try_current().is_none());
    }

    #[test]
    fn test_local_tasks_run_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        EventLoop::run_main(move || {
            let lp = EventLoop::current().unwrap();
            for i in 0..3 {
                let s = s.clone();
                lp.queue_local(move || s.borrow_mut().push(i));
            }
        })
        .unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ref_keeps_loop_alive_until_cross_thread_call() {
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        EventLoop::run_main(move || {
            let lp = EventLoop::current().unwrap();
            lp.ref_handle();
            let handle = lp.handle();
            std::thread::spawn(move || {
                handle.call(|| EventLoop::current().unwrap().unref_handle());
            });
            lp.queue_local(move || d.set(true));
        })
        .unwrap();
        assert!(done.get());
    }

    #[test]
    fn test_stop_leaves_before_next_task() {
        let ran = Rc::new(Cell::new(0));
        let r = ran.clone();
        let code = EventLoop::run_main(move || {
            let lp = EventLoop::current().unwrap();
            let r1 = r.clone();
            let lp1 = lp.clone();
            lp.queue_local(move || {
                r1.set(r1.get() + 1);
                lp1.request_exit(7);
            });
            lp.queue_local(move || r.set(r.get() + 1));
            lp
        })
        .unwrap()
        .exit_code();
        assert_eq!(ran.get(), 1);
        assert_eq!(code, 7);
    }

    #[test]
    fn test_fatal_hook_receives_panics() {
        let caught = Rc::new(RefCell::new(None));
        let c = caught.clone();
        EventLoop::run_main(move || {
            let lp = EventLoop::current().unwrap();
            lp.set_fatal_hook(move |thrown| {
                *c.borrow_mut() = thrown.message().map(str::to_string);
            });
            lp.queue_local(|| panic!("kaboom"));
        })
        .unwrap();
        assert_eq!(caught.borrow().as_deref(), Some("kaboom"));
    }
}
