//! Per-thread cooperative scheduling.
//!
//! Every thread that owns ports or workers runs exactly one [`EventLoop`].
//! Callbacks on a loop run one at a time; other threads can only reach it
//! through a [`LoopHandle`], which posts wake-ups into the loop's inbox.
//!
//! A loop keeps running while its keep-alive counter is above zero or work
//! is queued. Handles (ports, worker handles, stdio streams with pending
//! demand) bump the counter while they expect more events.

mod event_loop;

pub use event_loop::{EventLoop, LoopHandle, MAIN_THREAD_ID, ThreadId};
pub(crate) use event_loop::{Wake, Wakeable, next_handle_id, next_thread_id};
