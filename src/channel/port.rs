use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use tracing::trace;

use crate::channel::core::{Delivery, Envelope, PortCore, PortId};
use crate::channel::shared::SharedRef;
use crate::channel::tracker::track_interest;
use crate::emitter::{Emitter, Event, ListenerId};
use crate::error::{Result, WorkerError};
use crate::runtime::{EventLoop, Wakeable};

/// Something that can be listed in a transfer list.
pub enum Transferable {
    /// Moved: every handle to it on the sending thread becomes unusable.
    Port(MessagePort),
    Shared(SharedRef),
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: Value,
    pub ports: Vec<MessagePort>,
    pub shared: Vec<SharedRef>,
}

#[derive(Debug)]
pub enum PortEvent {
    Message(MessageEvent),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum PortEventName {
    Message,
    Close,
}

impl Event for PortEvent {
    type Name = PortEventName;

    fn name(&self) -> PortEventName {
        match self {
            PortEvent::Message(_) => PortEventName::Message,
            PortEvent::Close => PortEventName::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Closed,
    Transferred,
}

type Handler = Rc<dyn Fn(&MessageEvent)>;

pub(crate) struct PortInner {
    id: PortId,
    core: RefCell<Option<PortCore>>,
    status: Cell<Status>,
    started: Cell<bool>,
    refed: Cell<bool>,
    pinned: Cell<bool>,
    handler: RefCell<Option<Handler>>,
    events: Emitter<PortEvent>,
    lp: EventLoop,
}

/// One end of a channel, bound to the event loop of the thread holding it.
///
/// Clones are aliases of the same end on the same thread. Transferring the
/// port moves the end to another thread and invalidates every alias.
#[derive(Clone)]
pub struct MessagePort {
    inner: Rc<PortInner>,
}

#[derive(Clone)]
pub struct WeakPort(Weak<PortInner>);

impl WeakPort {
    pub fn upgrade(&self) -> Option<MessagePort> {
        self.0.upgrade().map(|inner| MessagePort { inner })
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status.get())
            .field("started", &self.inner.started.get())
            .field("refed", &self.inner.refed.get())
            .finish()
    }
}

impl MessagePort {
    /// Binds a channel end to `lp`. Starts stopped and unref'd; adding a
    /// message listener refs and starts it.
    pub(crate) fn adopt(core: PortCore, lp: &EventLoop) -> Self {
        let id = core.id();
        let inner = Rc::new(PortInner {
            id,
            core: RefCell::new(None),
            status: Cell::new(Status::Active),
            started: Cell::new(false),
            refed: Cell::new(false),
            pinned: Cell::new(false),
            handler: RefCell::new(None),
            events: Emitter::new(),
            lp: lp.clone(),
        });
        let weak: Weak<PortInner> = Rc::downgrade(&inner);
        lp.register(id, weak);
        core.bind(lp.handle());
        *inner.core.borrow_mut() = Some(core);

        let port = MessagePort { inner };
        track_interest(&port, &port.inner.events, PortEventName::Message);
        port
    }

    pub fn id(&self) -> PortId {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakPort {
        WeakPort(Rc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &MessagePort) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.status.get() == Status::Closed
    }

    pub fn is_transferred(&self) -> bool {
        self.inner.status.get() == Status::Transferred
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.get()
    }

    pub fn has_ref(&self) -> bool {
        self.inner.refed.get()
    }

    /// Serializes `value` and posts it without a transfer list.
    pub fn post(&self, value: impl Serialize) -> Result<bool> {
        self.post_message(serde_json::to_value(value)?, Vec::new())
    }

    /// Enqueues `data` for the peer, moving everything in `transfer`.
    ///
    /// Never blocks. `Ok(false)` means the channel is closed and the message
    /// was dropped; transferred ports in it are closed.
    pub fn post_message(&self, data: Value, transfer: Vec<Transferable>) -> Result<bool> {
        match self.inner.status.get() {
            Status::Transferred => return Err(WorkerError::UseAfterTransfer),
            Status::Closed => return Ok(false),
            Status::Active => {}
        }
        self.check_transfer_list(&transfer)?;

        let mut ports = Vec::new();
        let mut shared = Vec::new();
        for item in transfer {
            match item {
                Transferable::Port(port) => ports.push(port.detach()?),
                Transferable::Shared(handle) => shared.push(handle),
            }
        }
        let envelope = Envelope { data, ports, shared };
        let core = self.inner.core.borrow();
        let Some(core) = core.as_ref() else {
            return Ok(false);
        };
        let delivered = core.send(envelope);
        trace!(port = self.inner.id, delivered, "posted message");
        Ok(delivered)
    }

    fn check_transfer_list(&self, transfer: &[Transferable]) -> Result<()> {
        let ports: Vec<&MessagePort> = transfer
            .iter()
            .filter_map(|t| match t {
                Transferable::Port(p) => Some(p),
                Transferable::Shared(_) => None,
            })
            .collect();
        for (i, port) in ports.iter().enumerate() {
            if port.ptr_eq(self) {
                return Err(WorkerError::InvalidTransfer(
                    "a port cannot transfer itself".into(),
                ));
            }
            if self.is_entangled_with(port) {
                return Err(WorkerError::InvalidTransfer(
                    "a port cannot transfer its own peer".into(),
                ));
            }
            if ports[..i].iter().any(|p| p.ptr_eq(port)) {
                return Err(WorkerError::InvalidTransfer(
                    "port listed twice in transfer list".into(),
                ));
            }
            match port.inner.status.get() {
                Status::Transferred => return Err(WorkerError::UseAfterTransfer),
                Status::Closed => {
                    return Err(WorkerError::InvalidTransfer("port is closed".into()));
                }
                Status::Active => {}
            }
        }
        Ok(())
    }

    fn is_entangled_with(&self, other: &MessagePort) -> bool {
        let own = self.inner.core.borrow();
        let theirs = other.inner.core.borrow();
        match (own.as_ref(), theirs.as_ref()) {
            (Some(own), Some(theirs)) => own.is_peer_of(theirs),
            _ => false,
        }
    }

    /// Hands the channel end over for transfer, invalidating this handle and its aliases.
    pub(crate) fn detach(&self) -> Result<PortCore> {
        if self.inner.status.get() == Status::Transferred {
            return Err(WorkerError::UseAfterTransfer);
        }
        let core = self
            .inner
            .core
            .borrow_mut()
            .take()
            .ok_or_else(|| WorkerError::InvalidTransfer("port is closed".into()))?;
        core.unbind();
        self.inner.status.set(Status::Transferred);
        self.inner.started.set(false);
        self.unref();
        self.inner.handler.borrow_mut().take();
        self.inner.pinned.set(false);
        self.inner.lp.unregister(self.inner.id);
        Ok(core)
    }

    pub fn ref_(&self) {
        if self.inner.status.get() == Status::Active && !self.inner.refed.get() {
            self.inner.refed.set(true);
            self.inner.lp.ref_handle();
        }
        self.sync_pin();
    }

    pub fn unref(&self) {
        if self.inner.refed.replace(false) {
            self.inner.lp.unref_handle();
        }
        self.sync_pin();
    }

    // The loop holds the port strongly while it is ref'd or has someone to
    // deliver to, and only weakly otherwise.
    fn sync_pin(&self) {
        let inner = &self.inner;
        let wanted = inner.status.get() == Status::Active
            && (inner.refed.get()
                || inner.handler.borrow().is_some()
                || inner.events.listener_count(PortEventName::Message) > 0);
        if inner.pinned.replace(wanted) == wanted {
            return;
        }
        if wanted {
            let target: Rc<dyn Wakeable> = inner.clone();
            inner.lp.pin(inner.id, target);
        } else {
            let target: Weak<PortInner> = Rc::downgrade(inner);
            inner.lp.register(inner.id, target);
        }
    }

    /// Resumes delivery. Messages queued while stopped are delivered in order.
    pub fn start(&self) {
        if self.inner.status.get() != Status::Active || self.inner.started.replace(true) {
            return;
        }
        let pending = self
            .inner
            .core
            .borrow()
            .as_ref()
            .is_some_and(|c| c.has_queued() || c.peer_closed());
        if pending {
            self.schedule_pump();
        }
    }

    /// Pauses delivery; incoming messages are buffered, not dropped.
    pub fn stop(&self) {
        self.inner.started.set(false);
    }

    /// Single-callback delivery. Refs and starts the port.
    pub fn set_handler(&self, handler: impl Fn(&MessageEvent) + 'static) {
        *self.inner.handler.borrow_mut() = Some(Rc::new(handler));
        self.ref_();
        self.start();
    }

    /// Removes the single callback; unrefs and stops unless message listeners remain.
    pub fn clear_handler(&self) {
        self.inner.handler.borrow_mut().take();
        if self.inner.events.listener_count(PortEventName::Message) == 0 {
            self.stop();
            self.unref();
        }
        self.sync_pin();
    }

    /// Multi-listener delivery. The first listener refs and starts the port,
    /// removing the last one stops and unrefs it.
    pub fn on_message(&self, listener: impl Fn(&MessageEvent) + 'static) -> ListenerId {
        self.inner.events.on(PortEventName::Message, move |ev| {
            if let PortEvent::Message(msg) = ev {
                listener(msg);
            }
        })
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner
            .events
            .on(PortEventName::Close, move |_| listener())
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let removed = self.inner.events.off(id);
        self.sync_pin();
        removed
    }

    pub fn events(&self) -> &Emitter<PortEvent> {
        &self.inner.events
    }

    /// Delivers everything still queued right now, started or not.
    pub fn drain(&self) {
        while self.deliver_next() {}
        self.close_if_peer_gone();
    }

    pub fn close(&self) {
        self.close_with(|| {});
    }

    /// Closes this end and tells the peer. Idempotent; `on_done` runs after the
    /// "close" event, also when the port was already closed. On a transferred
    /// handle there is nothing left to close and `on_done` is queued as is.
    pub fn close_with(&self, on_done: impl FnOnce() + 'static) {
        match self.inner.status.get() {
            Status::Transferred | Status::Closed => {
                self.inner.lp.queue_local(on_done);
                return;
            }
            Status::Active => {}
        }
        self.inner.status.set(Status::Closed);
        self.inner.started.set(false);
        self.unref();
        self.inner.handler.borrow_mut().take();
        if let Some(core) = self.inner.core.borrow().as_ref() {
            core.close();
        }
        self.inner.pinned.set(false);
        self.inner.lp.unregister(self.inner.id);
        trace!(port = self.inner.id, "closed");

        // holds the port so "close" reaches its listeners even with every handle dropped
        let port = self.clone();
        self.inner.lp.queue_local(move || {
            port.inner.events.emit(&PortEvent::Close);
            port.inner.events.remove_all();
            on_done();
        });
    }

    fn schedule_pump(&self) {
        let weak = self.downgrade();
        self.inner.lp.queue_local(move || {
            if let Some(port) = weak.upgrade() {
                port.pump();
            }
        });
    }

    /// Delivers one message, re-queueing itself while more are waiting.
    fn pump(&self) {
        if !self.inner.started.get() {
            self.close_if_peer_gone();
            return;
        }
        if self.deliver_next() {
            let more = self
                .inner
                .core
                .borrow()
                .as_ref()
                .is_some_and(PortCore::has_queued);
            if more {
                self.schedule_pump();
                return;
            }
        }
        self.close_if_peer_gone();
    }

    fn deliver_next(&self) -> bool {
        if self.inner.status.get() != Status::Active {
            return false;
        }
        let delivery = match self.inner.core.borrow().as_ref() {
            Some(core) => core.pop(),
            None => return false,
        };
        let mut envelope = match delivery {
            Delivery::Message(envelope) => envelope,
            Delivery::Empty => return false,
        };
        let ports = std::mem::take(&mut envelope.ports)
            .into_iter()
            .map(|core| MessagePort::adopt(core, &self.inner.lp))
            .collect();
        let event = PortEvent::Message(MessageEvent {
            data: std::mem::take(&mut envelope.data),
            ports,
            shared: std::mem::take(&mut envelope.shared),
        });
        trace!(port = self.inner.id, "delivering message");
        let handler = self.inner.handler.borrow().clone();
        if let (Some(handler), PortEvent::Message(msg)) = (handler, &event) {
            handler(msg);
        }
        self.inner.events.emit(&event);
        true
    }

    /// The peer closed: finish closing once nothing deliverable is left.
    fn close_if_peer_gone(&self) {
        let gone = self.inner.core.borrow().as_ref().is_some_and(|core| {
            core.peer_closed() && (!core.has_queued() || !self.inner.started.get())
        });
        if gone {
            self.close();
        }
    }
}

impl Wakeable for PortInner {
    fn on_wake(self: Rc<Self>) {
        if let Some(core) = self.core.borrow().as_ref() {
            core.acknowledge_wake();
        }
        MessagePort { inner: self }.pump();
    }
}

impl Drop for PortInner {
    fn drop(&mut self) {
        if let Some(core) = self.core.get_mut().take() {
            if !core.is_closed() {
                core.close();
            }
        }
        if self.refed.get() {
            self.lp.unref_handle();
        }
        self.lp.unregister(self.id);
    }
}
