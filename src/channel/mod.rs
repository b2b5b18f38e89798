/*
  thread A                                         thread B
 ┌─────────────┐   post_message    ┌──────────────┐   wake(port id)  ┌─────────────┐
 │ MessagePort │ ───────────────▶ │ ChannelCore  │ ───────────────▶ │ MessagePort │
 │  (port1)    │ ◀─────────────── │ side0 │ side1│ ◀─────────────── │  (port2)    │
 └─────────────┘                   └──────────────┘                  └─────────────┘
        │                                                                    │
        └──── EventLoop A delivers                  EventLoop B delivers ────┘

  `core` is the Send half (queues, closed flags, owner loop).
  `port` is the thread-local half (listeners, started/ref state).
*/

pub mod core;
pub mod port;
pub mod shared;
pub mod tracker;

pub use self::core::PortId;
pub use port::{
    MessageEvent, MessagePort, PortEvent, PortEventName, Transferable, WeakPort,
};
pub use shared::{SharedRef, in_flight};
pub use tracker::track_interest;

use crate::channel::core::ChannelCore;
use crate::error::Result;
use crate::runtime::EventLoop;

/// Two entangled ports, both bound to the current thread's loop.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    pub fn new() -> Result<Self> {
        let lp = EventLoop::current()?;
        let (a, b) = ChannelCore::pair();
        Ok(Self {
            port1: MessagePort::adopt(a, &lp),
            port2: MessagePort::adopt(b, &lp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::runtime::LoopHandle;

    #[test]
    fn test_new_requires_a_loop() {
        assert!(MessageChannel::new().is_err());
    }

    #[test]
    fn test_cross_thread_fifo_and_close_propagation() {
        let received = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = received.clone();
        EventLoop::run_main(move || {
            let ch = MessageChannel::new().unwrap();
            let far = ch.port2.detach().unwrap();
            let received = sink.clone();
            thread::spawn(move || {
                let (handle, rx) = LoopHandle::pair(99);
                let lp = EventLoop::from_parts(handle, rx);
                lp.install();
                let port = MessagePort::adopt(far, &lp);
                let weak = port.downgrade();
                port.on_message(move |ev| {
                    let done = ev.data == json!("bye");
                    received.lock().unwrap().push(ev.data.clone());
                    if done {
                        weak.upgrade().unwrap().close();
                    }
                });
                lp.run();
                lp.uninstall();
            });
            for i in 0..50 {
                ch.port1.post(i).unwrap();
            }
            ch.port1.post("bye").unwrap();
            // stays alive until the far side closes and the close reaches us
            ch.port1.on_message(|_| {});
        })
        .unwrap();
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 51);
        for (i, v) in got.iter().take(50).enumerate() {
            assert_eq!(*v, json!(i));
        }
    }
}
