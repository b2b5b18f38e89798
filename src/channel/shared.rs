//! Shared handles that ride along messages instead of being copied.
//!
//! While a message carrying shared handles sits in a port's queue, the port
//! is recorded here. Delivery releases the record; closing the port disposes
//! whatever is still bound to it so nothing stays rooted by a dead channel.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::channel::core::PortId;

static IN_FLIGHT: Lazy<DashMap<PortId, usize>> = Lazy::new(DashMap::new);

#[derive(Clone)]
pub struct SharedRef(Arc<dyn Any + Send + Sync>);

impl SharedRef {
    pub fn new(value: impl Any + Send + Sync) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Live clones of this handle, including this one.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for SharedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedRef(..)")
    }
}

pub(crate) fn record(port: PortId, count: usize) {
    if count > 0 {
        *IN_FLIGHT.entry(port).or_insert(0) += count;
    }
}

pub(crate) fn release(port: PortId, count: usize) {
    if count == 0 {
        return;
    }
    let empty = match IN_FLIGHT.get_mut(&port) {
        Some(mut n) => {
            *n = n.saturating_sub(count);
            *n == 0
        }
        None => false,
    };
    if empty {
        IN_FLIGHT.remove_if(&port, |_, n| *n == 0);
    }
}

pub(crate) fn dispose(port: PortId) {
    IN_FLIGHT.remove(&port);
}

/// Shared handles queued for `port` and not delivered yet.
pub fn in_flight(port: PortId) -> usize {
    IN_FLIGHT.get(&port).map(|n| *n).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::core::{ChannelCore, Delivery, Envelope};
    use serde_json::json;

    #[test]
    fn test_record_release_dispose() {
        let (a, b) = ChannelCore::pair();
        let handle = SharedRef::new(vec![1u8, 2, 3]);
        a.send(Envelope { data: json!(1), ports: vec![], shared: vec![handle.clone()] });
        a.send(Envelope { data: json!(2), ports: vec![], shared: vec![handle.clone()] });
        assert_eq!(in_flight(b.id()), 2);

        assert!(matches!(b.pop(), Delivery::Message(_)));
        assert_eq!(in_flight(b.id()), 1);

        b.close();
        assert_eq!(in_flight(b.id()), 0);
        assert_eq!(handle.strong_count(), 1);
    }

    #[test]
    fn test_downcast() {
        let handle = SharedRef::new(String::from("table"));
        assert_eq!(handle.downcast_ref::<String>().map(String::as_str), Some("table"));
        assert!(handle.downcast_ref::<u32>().is_none());
    }
}
