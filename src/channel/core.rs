//! Thread-safe half of a channel: the two per-side queues and their flags.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::channel::shared::{self, SharedRef};
use crate::runtime::{LoopHandle, Wake, next_handle_id};

pub type PortId = u64;

/// A message waiting in the receiving side's queue.
pub(crate) struct Envelope {
    pub(crate) data: Value,
    pub(crate) ports: Vec<PortCore>,
    pub(crate) shared: Vec<SharedRef>,
}

impl Drop for Envelope {
    // Ports riding in a discarded message are closed, so their peers see it.
    fn drop(&mut self) {
        for port in self.ports.drain(..) {
            port.close();
        }
    }
}

struct SideState {
    port_id: PortId,
    queue: VecDeque<Envelope>,
    owner: Option<LoopHandle>,
    wake_pending: bool,
    closed: bool,
    peer_closed: bool,
}

impl SideState {
    fn new() -> Self {
        Self {
            port_id: next_handle_id(),
            queue: VecDeque::new(),
            owner: None,
            wake_pending: false,
            closed: false,
            peer_closed: false,
        }
    }

    /// Wakes the owning loop unless a wake-up is already on its way.
    fn schedule_wake(&mut self) {
        if self.wake_pending {
            return;
        }
        if let Some(owner) = &self.owner {
            self.wake_pending = owner.wake(Wake::Handle(self.port_id));
        }
    }
}

/// Both ends of a channel. Neither end outlives it: each port holds the whole core.
pub(crate) struct ChannelCore {
    sides: [Mutex<SideState>; 2],
}

impl ChannelCore {
    pub(crate) fn pair() -> (PortCore, PortCore) {
        let core = Arc::new(ChannelCore {
            sides: [Mutex::new(SideState::new()), Mutex::new(SideState::new())],
        });
        (
            PortCore { channel: core.clone(), side: 0 },
            PortCore { channel: core, side: 1 },
        )
    }

    fn side(&self, side: usize) -> MutexGuard<'_, SideState> {
        self.sides[side].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `Send` reference to one side of a channel; what crosses threads on transfer.
pub(crate) struct PortCore {
    channel: Arc<ChannelCore>,
    side: usize,
}

pub(crate) enum Delivery {
    Message(Envelope),
    Empty,
}

impl PortCore {
    pub(crate) fn id(&self) -> PortId {
        self.own().port_id
    }

    /// Whether `other` is the opposite end of this same channel.
    pub(crate) fn is_peer_of(&self, other: &PortCore) -> bool {
        Arc::ptr_eq(&self.channel, &other.channel) && self.side != other.side
    }

    fn own(&self) -> MutexGuard<'_, SideState> {
        self.channel.side(self.side)
    }

    fn peer(&self) -> MutexGuard<'_, SideState> {
        self.channel.side(1 - self.side)
    }

    /// Binds this side to `owner`, waking it if work piled up while unbound.
    pub(crate) fn bind(&self, owner: LoopHandle) {
        let mut own = self.own();
        own.owner = Some(owner);
        own.wake_pending = false;
        if !own.queue.is_empty() || own.peer_closed {
            own.schedule_wake();
        }
    }

    pub(crate) fn unbind(&self) {
        let mut own = self.own();
        own.owner = None;
        own.wake_pending = false;
    }

    /// Enqueues for the peer. Returns false (dropping the message) when either side is closed.
    pub(crate) fn send(&self, envelope: Envelope) -> bool {
        // Only this side's owner flips its `closed` flag, so checking it
        // without holding the lock while touching the peer is race free.
        if self.own().closed {
            return false;
        }
        let mut peer = self.peer();
        if peer.closed {
            return false;
        }
        shared::record(peer.port_id, envelope.shared.len());
        peer.queue.push_back(envelope);
        peer.schedule_wake();
        true
    }

    /// Called by the owner when a wake-up arrives.
    pub(crate) fn acknowledge_wake(&self) {
        self.own().wake_pending = false;
    }

    pub(crate) fn pop(&self) -> Delivery {
        let mut own = self.own();
        if own.closed {
            return Delivery::Empty;
        }
        match own.queue.pop_front() {
            Some(envelope) => {
                shared::release(own.port_id, envelope.shared.len());
                Delivery::Message(envelope)
            }
            None => Delivery::Empty,
        }
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.own().queue.is_empty()
    }

    pub(crate) fn peer_closed(&self) -> bool {
        self.own().peer_closed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.own().closed
    }

    /// Closes this side: undelivered messages are discarded and the peer is told.
    /// Idempotent.
    pub(crate) fn close(&self) {
        let discarded = {
            let mut own = self.own();
            if own.closed {
                return;
            }
            own.closed = true;
            own.owner = None;
            shared::dispose(own.port_id);
            std::mem::take(&mut own.queue)
        };
        drop(discarded);
        let mut peer = self.peer();
        if !peer.closed {
            peer.peer_closed = true;
            peer.schedule_wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(n: i64) -> Envelope {
        Envelope { data: json!(n), ports: vec![], shared: vec![] }
    }

    fn data(d: Delivery) -> Option<Value> {
        match d {
            Delivery::Message(mut e) => Some(std::mem::take(&mut e.data)),
            Delivery::Empty => None,
        }
    }

    #[test]
    fn test_fifo_per_sender() {
        let (a, b) = ChannelCore::pair();
        for i in 0..5 {
            assert!(a.send(envelope(i)));
        }
        let got: Vec<Value> = std::iter::from_fn(|| data(b.pop())).collect();
        assert_eq!(got, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_send_to_closed_peer_is_dropped() {
        let (a, b) = ChannelCore::pair();
        b.close();
        assert!(!a.send(envelope(1)));
        assert!(a.peer_closed());
    }

    #[test]
    fn test_close_discards_undelivered() {
        let (a, b) = ChannelCore::pair();
        a.send(envelope(1));
        b.close();
        assert!(data(b.pop()).is_none());
        assert!(!b.has_queued());
    }

    #[test]
    fn test_ports_in_discarded_messages_are_closed() {
        let (a, b) = ChannelCore::pair();
        let (c, d) = ChannelCore::pair();
        a.send(Envelope { data: json!(null), ports: vec![c], shared: vec![] });
        b.close();
        assert!(d.peer_closed());
    }

    #[test]
    fn test_port_ids_are_distinct() {
        let (a, b) = ChannelCore::pair();
        assert_ne!(a.id(), b.id());
    }
}
