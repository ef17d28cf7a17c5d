//! A stream whose operations complete from a script.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::buffer::StreamBuf;
use crate::error::ErrorCode;
use crate::handler::CompletionHandler;
use crate::net::AsyncStream;
use crate::reactor::{Reactor, WeakReactor};

/// Scripted outcome of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Writes: accept every byte. Reads: complete from what is buffered.
    Complete,
    /// Reads: append these bytes to the buffer, then complete.
    Reply(Vec<u8>),
    /// Complete with this error and transfer count.
    Fail(ErrorCode, usize),
}

struct ScriptedInner {
    reactor: WeakReactor,
    writes: RefCell<VecDeque<Step>>,
    reads: RefCell<VecDeque<Step>>,
    written: RefCell<Vec<Vec<u8>>>,
    reads_started: Cell<usize>,
}

/// An [`AsyncStream`] that never touches a socket.
///
/// Each operation takes the next [`Step`] of its script and queues the
/// result on the reactor with
/// [`post_completion`](Reactor::post_completion), so handlers still go
/// through their hooks and are never invoked from the initiating call. An
/// operation with no scripted step fails with `ENOTCONN`.
#[derive(Clone)]
pub struct ScriptedStream {
    inner: Rc<ScriptedInner>,
}

impl ScriptedStream {
    /// Create a stream with an empty script.
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            inner: Rc::new(ScriptedInner {
                reactor: reactor.downgrade(),
                writes: RefCell::new(VecDeque::new()),
                reads: RefCell::new(VecDeque::new()),
                written: RefCell::new(Vec::new()),
                reads_started: Cell::new(0),
            }),
        }
    }

    /// Append a step for the next write.
    pub fn then_write(self, step: Step) -> Self {
        self.inner.writes.borrow_mut().push_back(step);
        self
    }

    /// Append a step for the next read.
    pub fn then_read(self, step: Step) -> Self {
        self.inner.reads.borrow_mut().push_back(step);
        self
    }

    /// Bytes accepted by each write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.written.borrow().clone()
    }

    /// Number of reads started.
    pub fn reads_started(&self) -> usize {
        self.inner.reads_started.get()
    }

    fn not_connected() -> Step {
        Step::Fail(ErrorCode::Os(libc::ENOTCONN), 0)
    }

    fn deliver<H: CompletionHandler>(&self, handler: H, ec: ErrorCode, n: usize) {
        match self.inner.reactor.upgrade() {
            Some(reactor) => reactor.post_completion(handler, ec, n),
            None => tracing::warn!("reactor dropped; scripted completion discarded"),
        }
    }
}

impl AsyncStream for ScriptedStream {
    fn async_write<H: CompletionHandler>(&self, data: Vec<u8>, handler: H) {
        let step = self
            .inner
            .writes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(Self::not_connected);

        let (ec, n) = match step {
            Step::Complete | Step::Reply(_) => (ErrorCode::Success, data.len()),
            Step::Fail(ec, n) => (ec, n.min(data.len())),
        };
        self.inner.written.borrow_mut().push(data[..n].to_vec());
        self.deliver(handler, ec, n);
    }

    fn async_read_until<H: CompletionHandler>(&self, buf: &StreamBuf, delimiter: u8, handler: H) {
        self.inner.reads_started.set(self.inner.reads_started.get() + 1);
        let step = self
            .inner
            .reads
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(Self::not_connected);

        let (ec, n) = match step {
            Step::Fail(ec, n) => (ec, n),
            Step::Complete | Step::Reply(_) => {
                if let Step::Reply(bytes) = &step {
                    buf.extend(bytes);
                }
                match buf.find(delimiter, 0) {
                    Some(pos) => (ErrorCode::Success, pos + 1),
                    None => (ErrorCode::eof(), 0),
                }
            }
        };
        self.deliver(handler, ec, n);
    }

    fn reactor(&self) -> Option<Reactor> {
        self.inner.reactor.upgrade()
    }
}

impl fmt::Debug for ScriptedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedStream")
            .field("pending_writes", &self.inner.writes.borrow().len())
            .field("pending_reads", &self.inner.reads.borrow().len())
            .field("reads_started", &self.inner.reads_started.get())
            .finish()
    }
}
