//! Stdio bridging between a worker and its owner over the control port.
//!
//! Readable ends pull: each pull cycle sends one `WantsMoreData` and waits
//! for the next `StdioPayload`. Writable ends push a payload per write and
//! hold the write's completion until the reader asks for more. Every stream
//! that is waiting on the other side counts toward [`StdioDemand`], and the
//! control port stays ref'd while that count is above zero.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::Write;
use std::rc::Rc;

use strum_macros::{AsRefStr, Display};
use tracing::{trace, warn};

use crate::channel::MessagePort;
use crate::emitter::{Emitter, Event, ListenerId};
use crate::error::{Result, WorkerError};
use crate::message::{ControlMessage, StdioStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioEvent {
    Data(Vec<u8>),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum StdioEventName {
    Data,
    End,
}

impl Event for StdioEvent {
    type Name = StdioEventName;

    fn name(&self) -> StdioEventName {
        match self {
            StdioEvent::Data(_) => StdioEventName::Data,
            StdioEvent::End => StdioEventName::End,
        }
    }
}

/// Number of streams waiting on the other side of one control port.
pub(crate) struct StdioDemand {
    port: MessagePort,
    waiting: Cell<usize>,
}

impl StdioDemand {
    pub(crate) fn new(port: &MessagePort) -> Rc<Self> {
        Rc::new(Self {
            port: port.clone(),
            waiting: Cell::new(0),
        })
    }

    fn increment(&self) {
        let before = self.waiting.get();
        self.waiting.set(before + 1);
        if before == 0 {
            self.port.ref_();
        }
    }

    fn decrement(&self, by: usize) {
        if by == 0 {
            return;
        }
        let after = self.waiting.get().saturating_sub(by);
        self.waiting.set(after);
        if after == 0 {
            self.port.unref();
        }
    }

    pub(crate) fn waiting(&self) -> usize {
        self.waiting.get()
    }

    fn send(&self, msg: &ControlMessage) -> Result<bool> {
        self.port.post_message(msg.encode()?, Vec::new())
    }
}

struct ReadableInner {
    stream: StdioStream,
    demand: Rc<StdioDemand>,
    buffer: RefCell<VecDeque<Vec<u8>>>,
    flowing: Cell<bool>,
    pulling: Cell<bool>,
    started_reading: Cell<bool>,
    increments_ref: Cell<bool>,
    ended: Cell<bool>,
    end_emitted: Cell<bool>,
    end_scheduled: Cell<bool>,
    events: Emitter<StdioEvent>,
}

/// Receiving end of a bridged stream.
#[derive(Clone)]
pub struct ReadableStdio {
    inner: Rc<ReadableInner>,
}

impl ReadableStdio {
    pub(crate) fn new(stream: StdioStream, demand: &Rc<StdioDemand>) -> Self {
        Self {
            inner: Rc::new(ReadableInner {
                stream,
                demand: demand.clone(),
                buffer: RefCell::new(VecDeque::new()),
                flowing: Cell::new(false),
                pulling: Cell::new(false),
                started_reading: Cell::new(false),
                increments_ref: Cell::new(true),
                ended: Cell::new(false),
                end_emitted: Cell::new(false),
                end_scheduled: Cell::new(false),
                events: Emitter::new(),
            }),
        }
    }

    pub fn stream(&self) -> StdioStream {
        self.inner.stream
    }

    /// Whether reading from this stream keeps the control port ref'd.
    pub fn set_increments_ref(&self, value: bool) {
        self.inner.increments_ref.set(value);
    }

    /// Adds a data listener and switches the stream to flowing mode.
    pub fn on_data(&self, listener: impl Fn(&[u8]) + 'static) -> ListenerId {
        let id = self.inner.events.on(StdioEventName::Data, move |ev| {
            if let StdioEvent::Data(chunk) = ev {
                listener(chunk);
            }
        });
        self.resume();
        id
    }

    pub fn on_end(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner.events.on(StdioEventName::End, move |_| listener())
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    pub fn is_flowing(&self) -> bool {
        self.inner.flowing.get()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.end_emitted.get()
    }

    pub fn resume(&self) {
        if self.inner.flowing.replace(true) {
            return;
        }
        self.flush();
    }

    pub fn pause(&self) {
        self.inner.flowing.set(false);
    }

    /// Paused-mode read. `None` means nothing is buffered yet (or the stream ended).
    pub fn read(&self) -> Option<Vec<u8>> {
        let chunk = self.inner.buffer.borrow_mut().pop_front();
        if self.inner.buffer.borrow().is_empty() {
            if self.inner.ended.get() {
                self.schedule_end();
            } else {
                self.pull();
            }
        }
        chunk
    }

    /// Copies everything this stream yields into `sink`.
    pub fn pipe_to(&self, sink: impl Write + 'static) -> ListenerId {
        let sink = RefCell::new(sink);
        let stream = self.inner.stream;
        self.on_data(move |chunk| {
            let mut sink = sink.borrow_mut();
            if let Err(err) = sink.write_all(chunk).and_then(|()| sink.flush()) {
                warn!(%stream, %err, "failed to forward stdio chunk");
            }
        })
    }

    fn pull(&self) {
        let inner = &self.inner;
        if inner.ended.get() || inner.pulling.get() {
            return;
        }
        if !inner.started_reading.get() && inner.increments_ref.get() {
            inner.started_reading.set(true);
            inner.demand.increment();
        }
        inner.pulling.set(true);
        let msg = ControlMessage::WantsMoreData {
            stream: inner.stream,
        };
        match inner.demand.send(&msg) {
            Ok(true) => trace!(stream = %inner.stream, "requested more data"),
            Ok(false) => trace!(stream = %inner.stream, "control port closed, pull dropped"),
            Err(err) => warn!(stream = %inner.stream, %err, "failed to request more data"),
        }
    }

    /// Pushes end-of-stream unless the other side already did.
    pub(crate) fn finish(&self) {
        if !self.inner.ended.get() {
            self.push(None);
        }
    }

    /// Feeds a chunk from the other side; `None` is end-of-stream.
    pub(crate) fn push(&self, chunk: Option<Vec<u8>>) {
        let inner = &self.inner;
        inner.pulling.set(false);
        match chunk {
            None => {
                inner.ended.set(true);
                if inner.buffer.borrow().is_empty() && inner.flowing.get() {
                    self.schedule_end();
                }
            }
            Some(bytes) => {
                inner.buffer.borrow_mut().push_back(bytes);
                if inner.flowing.get() {
                    self.flush();
                }
            }
        }
    }

    fn flush(&self) {
        loop {
            if !self.inner.flowing.get() {
                return;
            }
            let chunk = self.inner.buffer.borrow_mut().pop_front();
            match chunk {
                Some(bytes) => {
                    self.inner.events.emit(&StdioEvent::Data(bytes));
                }
                None => break,
            }
        }
        if self.inner.ended.get() {
            self.schedule_end();
        } else {
            self.pull();
        }
    }

    fn schedule_end(&self) {
        let inner = &self.inner;
        if inner.end_emitted.get() || inner.end_scheduled.replace(true) {
            return;
        }
        let inner = inner.clone();
        let emit_end = move || {
            inner.end_emitted.set(true);
            if inner.started_reading.get() && inner.increments_ref.get() {
                inner.demand.decrement(1);
            }
            trace!(stream = %inner.stream, "end of stream");
            inner.events.emit(&StdioEvent::End);
        };
        match crate::runtime::EventLoop::try_current() {
            Some(lp) => lp.queue_local(emit_end),
            None => emit_end(),
        }
    }
}

struct WritableInner {
    stream: StdioStream,
    demand: Rc<StdioDemand>,
    acks: RefCell<Vec<Box<dyn FnOnce()>>>,
    ended: Cell<bool>,
}

/// Sending end of a bridged stream.
#[derive(Clone)]
pub struct WritableStdio {
    inner: Rc<WritableInner>,
}

impl WritableStdio {
    pub(crate) fn new(stream: StdioStream, demand: &Rc<StdioDemand>) -> Self {
        Self {
            inner: Rc::new(WritableInner {
                stream,
                demand: demand.clone(),
                acks: RefCell::new(Vec::new()),
                ended: Cell::new(false),
            }),
        }
    }

    pub fn stream(&self) -> StdioStream {
        self.inner.stream
    }

    pub fn write(&self, chunk: impl Into<Vec<u8>>) -> Result<()> {
        self.write_with(chunk.into(), None, || {})
    }

    pub fn write_str(&self, text: &str) -> Result<()> {
        self.write_with(text.as_bytes().to_vec(), Some("utf8"), || {})
    }

    /// Sends `chunk`; `on_ack` runs once the reader has asked for more.
    pub fn write_with(
        &self,
        chunk: Vec<u8>,
        encoding: Option<&str>,
        on_ack: impl FnOnce() + 'static,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.ended.get() {
            return Err(WorkerError::WriteAfterEnd(inner.stream));
        }
        let msg = ControlMessage::StdioPayload {
            stream: inner.stream,
            chunk: Some(chunk),
            encoding: encoding.map(str::to_owned),
        };
        if !inner.demand.send(&msg)? {
            trace!(stream = %inner.stream, "control port closed, write dropped");
            return Ok(());
        }
        inner.acks.borrow_mut().push(Box::new(on_ack));
        inner.demand.increment();
        Ok(())
    }

    /// Sends end-of-stream. Further writes fail with `WriteAfterEnd`.
    pub fn end(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.ended.replace(true) {
            return Ok(());
        }
        let msg = ControlMessage::StdioPayload {
            stream: inner.stream,
            chunk: None,
            encoding: None,
        };
        inner.demand.send(&msg)?;
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.get()
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.acks.borrow().len()
    }

    /// The reader drained everything: complete every pending write.
    pub(crate) fn on_wants_more_data(&self) {
        let acks = std::mem::take(&mut *self.inner.acks.borrow_mut());
        let count = acks.len();
        for ack in acks {
            ack();
        }
        self.inner.demand.decrement(count);
    }
}

/// Owner-side ends: what the owner writes to the worker's stdin and reads
/// from its stdout/stderr.
#[derive(Clone)]
pub struct ParentStdio {
    pub stdin: Option<WritableStdio>,
    pub stdout: ReadableStdio,
    pub stderr: ReadableStdio,
    demand: Rc<StdioDemand>,
}

impl ParentStdio {
    pub(crate) fn new(port: &MessagePort, has_stdin: bool) -> Self {
        let demand = StdioDemand::new(port);
        Self {
            stdin: has_stdin.then(|| WritableStdio::new(StdioStream::Stdin, &demand)),
            stdout: ReadableStdio::new(StdioStream::Stdout, &demand),
            stderr: ReadableStdio::new(StdioStream::Stderr, &demand),
            demand,
        }
    }

    pub(crate) fn waiting(&self) -> usize {
        self.demand.waiting()
    }

    /// Handles the stdio part of the control protocol. `Ok(false)` for non-stdio messages.
    pub(crate) fn route(&self, msg: &ControlMessage) -> Result<bool> {
        match msg {
            ControlMessage::StdioPayload { stream, chunk, .. } => {
                let target = match stream {
                    StdioStream::Stdout => &self.stdout,
                    StdioStream::Stderr => &self.stderr,
                    StdioStream::Stdin => {
                        return Err(WorkerError::ProtocolViolation(
                            "worker sent a stdin payload".into(),
                        ));
                    }
                };
                target.push(chunk.clone());
                Ok(true)
            }
            ControlMessage::WantsMoreData { stream } => match (stream, &self.stdin) {
                (StdioStream::Stdin, Some(stdin)) => {
                    stdin.on_wants_more_data();
                    Ok(true)
                }
                (StdioStream::Stdin, None) => Ok(true),
                (other, _) => Err(WorkerError::ProtocolViolation(format!(
                    "worker asked for more {other} data"
                ))),
            },
            _ => Ok(false),
        }
    }
}

/// Worker-side ends: stdin read from the owner, stdout/stderr written to it.
#[derive(Clone)]
pub struct WorkerStdio {
    pub stdin: ReadableStdio,
    pub stdout: WritableStdio,
    pub stderr: WritableStdio,
}

impl WorkerStdio {
    pub(crate) fn new(port: &MessagePort, has_stdin: bool) -> Self {
        let demand = StdioDemand::new(port);
        let stdin = ReadableStdio::new(StdioStream::Stdin, &demand);
        if !has_stdin {
            stdin.push(None);
        }
        Self {
            stdin,
            stdout: WritableStdio::new(StdioStream::Stdout, &demand),
            stderr: WritableStdio::new(StdioStream::Stderr, &demand),
        }
    }

    pub(crate) fn route(&self, msg: &ControlMessage) -> Result<bool> {
        match msg {
            ControlMessage::StdioPayload {
                stream: StdioStream::Stdin,
                chunk,
                ..
            } => {
                self.stdin.push(chunk.clone());
                Ok(true)
            }
            ControlMessage::StdioPayload { stream, .. } => Err(WorkerError::ProtocolViolation(
                format!("owner sent a {stream} payload"),
            )),
            ControlMessage::WantsMoreData { stream } => {
                match stream {
                    StdioStream::Stdout => self.stdout.on_wants_more_data(),
                    StdioStream::Stderr => self.stderr.on_wants_more_data(),
                    StdioStream::Stdin => {
                        return Err(WorkerError::ProtocolViolation(
                            "owner asked for more stdin data".into(),
                        ));
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::runtime::EventLoop;

    /// Wires both sides of one channel the way the worker machinery does.
    fn wire(ch: &MessageChannel, has_stdin: bool) -> (Rc<ParentStdio>, Rc<WorkerStdio>) {
        let parent = Rc::new(ParentStdio::new(&ch.port1, has_stdin));
        let worker = Rc::new(WorkerStdio::new(&ch.port2, has_stdin));
        let p = parent.clone();
        ch.port1.set_handler(move |ev| {
            let msg = ControlMessage::decode(&ev.data).unwrap();
            assert!(p.route(&msg).unwrap());
        });
        ch.port1.unref();
        let w = worker.clone();
        ch.port2.set_handler(move |ev| {
            let msg = ControlMessage::decode(&ev.data).unwrap();
            assert!(w.route(&msg).unwrap());
        });
        ch.port2.unref();
        (parent, worker)
    }

    #[test]
    fn test_worker_stdout_reaches_owner_and_acks() {
        let got = Rc::new(RefCell::new(Vec::new()));
        let acked = Rc::new(Cell::new(false));
        let ended = Rc::new(Cell::new(false));
        let (g, a, e) = (got.clone(), acked.clone(), ended.clone());
        EventLoop::run_main(move || {
            let ch = MessageChannel::new().unwrap();
            let (parent, worker) = wire(&ch, false);

            worker
                .stdout
                .write_with(b"hello ".to_vec(), None, move || a.set(true))
                .unwrap();
            worker.stdout.write_str("world").unwrap();
            assert_eq!(worker.stdout.pending_acks(), 2);
            assert!(ch.port2.has_ref());

            let g2 = g.clone();
            parent.stdout.on_data(move |chunk| g2.borrow_mut().extend_from_slice(chunk));
            // closing the owner side still lets the worker drain its queued pulls
            let p1 = ch.port1.clone();
            parent.stdout.on_end(move || {
                e.set(true);
                p1.close();
            });
            worker.stdout.end().unwrap();
        })
        .unwrap();
        assert_eq!(got.borrow().as_slice(), b"hello world");
        assert!(acked.get());
        assert!(ended.get());
    }

    #[test]
    fn test_pull_sends_one_request_per_cycle() {
        let requests = Rc::new(Cell::new(0));
        let r = requests.clone();
        EventLoop::run_main(move || {
            let ch = MessageChannel::new().unwrap();
            let demand = StdioDemand::new(&ch.port1);
            let stdout = ReadableStdio::new(StdioStream::Stdout, &demand);
            stdout.pull();
            stdout.pull();
            stdout.pull();
            assert_eq!(demand.waiting(), 1);
            assert!(ch.port1.has_ref());

            ch.port2.on_message(move |_| r.set(r.get() + 1));
            stdout.push(None);
            let (p1, p2) = (ch.port1.clone(), ch.port2.clone());
            stdout.on_end(move || {
                p1.close();
                p2.close();
            });
            stdout.resume();
        })
        .unwrap();
        assert_eq!(requests.get(), 1);
    }

    #[test]
    fn test_reader_that_never_pulls_never_asks_for_data() {
        let requests = Rc::new(Cell::new(0));
        let r = requests.clone();
        EventLoop::run_main(move || {
            let ch = MessageChannel::new().unwrap();
            let demand = StdioDemand::new(&ch.port1);
            let stdout = ReadableStdio::new(StdioStream::Stdout, &demand);
            stdout.push(Some(b"unread".to_vec()));
            stdout.push(None);
            assert_eq!(demand.waiting(), 0);
            assert!(!ch.port1.has_ref());

            ch.port2.on_message(move |_| r.set(r.get() + 1));
            ch.port1.close();
        })
        .unwrap();
        assert_eq!(requests.get(), 0);
    }

    #[test]
    fn test_one_request_completes_every_queued_write() {
        let acked = Rc::new(Cell::new(0));
        let a = acked.clone();
        let (worker, port2) = EventLoop::run_main(move || {
            let ch = MessageChannel::new().unwrap();
            let (parent, worker) = wire(&ch, false);
            for chunk in ["a", "b", "c"] {
                let a = a.clone();
                worker
                    .stdout
                    .write_with(chunk.as_bytes().to_vec(), None, move || a.set(a.get() + 1))
                    .unwrap();
            }
            assert_eq!(worker.stdout.pending_acks(), 3);
            assert_eq!(worker.stdout.inner.demand.waiting(), 3);
            assert!(ch.port2.has_ref());
            worker.stdout.end().unwrap();

            parent.stdout.on_data(|_| {});
            let p1 = ch.port1.clone();
            parent.stdout.on_end(move || p1.close());
            (worker, ch.port2.clone())
        })
        .unwrap();
        assert_eq!(acked.get(), 3);
        assert_eq!(worker.stdout.pending_acks(), 0);
        assert_eq!(worker.stdout.inner.demand.waiting(), 0);
        assert!(!port2.has_ref());
    }

    #[test]
    fn test_write_after_end_fails() {
        EventLoop::run_main(|| {
            let ch = MessageChannel::new().unwrap();
            let (_parent, worker) = wire(&ch, false);
            worker.stderr.end().unwrap();
            assert!(matches!(
                worker.stderr.write("late"),
                Err(WorkerError::WriteAfterEnd(StdioStream::Stderr))
            ));
            ch.port1.close();
        })
        .unwrap();
    }

    #[test]
    fn test_unreferenced_reader_does_not_hold_port() {
        EventLoop::run_main(|| {
            let ch = MessageChannel::new().unwrap();
            let (parent, worker) = wire(&ch, false);
            parent.stdout.set_increments_ref(false);
            parent.stdout.resume();
            assert_eq!(parent.waiting(), 0);
            assert!(!ch.port1.has_ref());
            drop(worker);
            ch.port1.close();
        })
        .unwrap();
    }

    #[test]
    fn test_misdirected_payload_is_a_violation() {
        EventLoop::run_main(|| {
            let ch = MessageChannel::new().unwrap();
            let parent = ParentStdio::new(&ch.port1, false);
            let msg = ControlMessage::StdioPayload {
                stream: StdioStream::Stdin,
                chunk: None,
                encoding: None,
            };
            assert!(matches!(
                parent.route(&msg),
                Err(WorkerError::ProtocolViolation(_))
            ));
            assert!(!parent.route(&ControlMessage::Ready).unwrap());
        })
        .unwrap();
    }
}
