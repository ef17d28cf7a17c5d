//! Single-threaded completion reactor.
//!
//! The [`Reactor`] owns the readiness backend and every pending operation.
//! It offers the two primitive stream operations composed operations are
//! built from (write-all and read-until-delimiter), plus `post` for plain
//! closures, and hands each result to a [`CompletionHandler`] exactly once.
//!
//! # Handler protocol
//!
//! For every operation the reactor:
//!
//! 1. asks the handler whether it [is a continuation](crate::HandlerHooks::is_continuation),
//! 2. moves the handler into storage from its own
//!    [`allocate`](crate::HandlerHooks::allocate) hook,
//! 3. on completion, returns that storage through
//!    [`deallocate`](crate::HandlerHooks::deallocate) and runs the handler
//!    through its [`Invoker`].
//!
//! I/O is attempted as soon as an operation is submitted, but a completion
//! is always queued and delivered from a later [`run_one`](Reactor::run_one)
//! turn, never from inside the initiating call.
//!
//! # Turns
//!
//! A turn delivers every completion that was queued when it started.
//! Completions whose handler reported itself as a continuation are also
//! delivered in the same turn, even when they were queued during it.
//!
//! # Lifetime
//!
//! Streams and the reactor's own invoker hold a [`WeakReactor`], so pending
//! handlers never keep the reactor alive. When the last [`Reactor`] handle
//! is dropped, every pending operation is destroyed as by
//! [`shutdown`](Reactor::shutdown).

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::backend::{detect_backend, Backend, Readiness};
use crate::buffer::StreamBuf;
use crate::config::ReactorConfig;
use crate::error::{ErrorCode, Result};
use crate::handler::{CompletionHandler, Dispatch, Invoker};
use crate::operation::raw::RawOp;
use crate::operation::tracker::{OperationHandle, OperationTracker};
use crate::operation::OperationType;

mod io;

#[cfg(test)]
mod tests;

use io::{drive_read, drive_write, IoSource, PendingRead, PendingWrite};

/// Counters describing what a reactor has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    /// Handler operations accepted (writes, reads, posted completions)
    pub submitted: u64,
    /// Handlers invoked
    pub completed: u64,
    /// Handlers destroyed without being invoked
    pub destroyed: u64,
    /// Submitted handlers that reported themselves as continuations
    pub continuation_hints: u64,
    /// Operations that finished during their initiating call
    pub speculative_completions: u64,
    /// Readiness events received from the backend
    pub readiness_events: u64,
    /// Turns run
    pub turns: u64,
}

enum Ready {
    Op {
        id: u64,
        op: RawOp,
        ec: ErrorCode,
        bytes_transferred: usize,
        continuation: bool,
    },
    Task {
        id: u64,
        f: Box<dyn FnOnce()>,
    },
}

impl Ready {
    fn is_continuation(&self) -> bool {
        matches!(self, Ready::Op { continuation: true, .. })
    }
}

struct Inner {
    config: ReactorConfig,
    backend: RefCell<Box<dyn Backend>>,
    sources: RefCell<HashMap<u64, IoSource>>,
    ready: RefCell<VecDeque<Ready>>,
    tracker: RefCell<OperationTracker>,
    stats: Cell<ReactorStats>,
    next_token: Cell<u64>,
    events: RefCell<Vec<Readiness>>,
    scratch: RefCell<Vec<u8>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let sources = std::mem::take(self.sources.get_mut());
        let ready = std::mem::take(self.ready.get_mut());
        let destroyed = release_sources(&mut **self.backend.get_mut(), &sources) + queued_ops(&ready);

        if destroyed > 0 {
            tracing::warn!(destroyed, "reactor dropped with operations pending");
        }
        // Handlers dropped here can no longer reach the reactor.
        drop(sources);
        drop(ready);
    }
}

/// Deregister every source from `backend`, returning how many operations
/// were still pending on them.
fn release_sources(backend: &mut dyn Backend, sources: &HashMap<u64, IoSource>) -> usize {
    for source in sources.values() {
        if let Err(err) = backend.deregister(source.fd) {
            tracing::debug!(fd = source.fd, %err, "backend deregistration failed");
        }
    }
    sources.values().map(IoSource::pending).sum()
}

fn queued_ops(ready: &VecDeque<Ready>) -> usize {
    ready.iter().filter(|r| matches!(r, Ready::Op { .. })).count()
}

/// Handle to a single-threaded reactor.
///
/// Cloning is cheap and yields another handle to the same reactor.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

/// Non-owning handle to a [`Reactor`].
///
/// Held by streams and by [`Reactor::invoker`], which may end up inside
/// pending handlers.
#[derive(Clone)]
pub struct WeakReactor {
    inner: Weak<Inner>,
}

impl WeakReactor {
    /// The reactor, unless every [`Reactor`] handle is gone.
    pub fn upgrade(&self) -> Option<Reactor> {
        self.inner.upgrade().map(|inner| Reactor { inner })
    }
}

impl Dispatch for WeakReactor {
    fn dispatch(&self, f: Box<dyn FnOnce()>) {
        match self.upgrade() {
            Some(reactor) => reactor.post(f),
            None => tracing::debug!("reactor dropped; dispatched call discarded"),
        }
    }
}

impl fmt::Debug for WeakReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakReactor")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Reactor {
    /// Create a reactor with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    /// Create a reactor with `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid configuration, or the OS error
    /// if the backend cannot be created.
    pub fn with_config(config: ReactorConfig) -> Result<Self> {
        config.validate()?;
        let backend = detect_backend(config.max_events)?;
        tracing::debug!(backend = backend.name(), "reactor created");

        Ok(Self {
            inner: Rc::new(Inner {
                backend: RefCell::new(backend),
                sources: RefCell::new(HashMap::new()),
                ready: RefCell::new(VecDeque::new()),
                tracker: RefCell::new(OperationTracker::new()),
                stats: Cell::new(ReactorStats::default()),
                next_token: Cell::new(1),
                events: RefCell::new(Vec::with_capacity(config.max_events)),
                scratch: RefCell::new(vec![0; config.read_chunk_size]),
                config,
            }),
        })
    }

    /// Configuration this reactor was created with.
    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    /// Snapshot of the reactor's counters.
    pub fn stats(&self) -> ReactorStats {
        self.inner.stats.get()
    }

    /// Number of operations and posted closures not yet delivered.
    pub fn outstanding(&self) -> usize {
        self.inner.tracker.borrow().count()
    }

    /// An [`Invoker`] that re-posts calls through this reactor.
    ///
    /// Calls dispatched after the reactor is dropped are discarded.
    pub fn invoker(&self) -> Invoker {
        Invoker::Dispatch(Rc::new(self.downgrade()))
    }

    /// A handle that does not keep the reactor alive.
    pub fn downgrade(&self) -> WeakReactor {
        WeakReactor {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Returns true if both handles refer to the same reactor.
    pub fn same_reactor(&self, other: &Reactor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn update_stats(&self, f: impl FnOnce(&mut ReactorStats)) {
        let mut stats = self.inner.stats.get();
        f(&mut stats);
        self.inner.stats.set(stats);
    }

    /// Register a non-blocking file descriptor and return its token.
    pub(crate) fn register_fd(&self, fd: RawFd) -> Result<u64> {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token.wrapping_add(1).max(1));

        self.inner.backend.borrow_mut().register(fd, token)?;
        self.inner.sources.borrow_mut().insert(token, IoSource::new(fd));
        tracing::debug!(fd, token, "registered source");
        Ok(token)
    }

    /// Stop watching `token`, destroying any operation still pending on it.
    ///
    /// Unknown tokens are ignored.
    pub(crate) fn deregister(&self, token: u64) {
        let Some(source) = self.inner.sources.borrow_mut().remove(&token) else {
            return;
        };

        if let Err(err) = self.inner.backend.borrow_mut().deregister(source.fd) {
            tracing::debug!(fd = source.fd, %err, "backend deregistration failed");
        }

        let destroyed = source.pending();
        if destroyed > 0 {
            let mut tracker = self.inner.tracker.borrow_mut();
            for id in source.write.iter().map(|w| w.id).chain(source.read.iter().map(|r| r.id)) {
                tracker.complete_operation(id);
            }
            drop(tracker);
            self.update_stats(|s| s.destroyed += destroyed as u64);
            tracing::warn!(token, destroyed, "source deregistered with operations pending");
        }

        tracing::debug!(fd = source.fd, token, "deregistered source");
        // Handlers are dropped here, after every borrow has been released.
        drop(source);
    }

    fn register_op(&self, op_type: OperationType, fd: Option<RawFd>, continuation: bool) -> u64 {
        self.inner
            .tracker
            .borrow_mut()
            .register_operation(op_type, fd, continuation)
    }

    /// Register an operation that will invoke a completion handler.
    fn register_handler_op(&self, op_type: OperationType, fd: Option<RawFd>, continuation: bool) -> u64 {
        let id = self.register_op(op_type, fd, continuation);
        self.update_stats(|s| {
            s.submitted += 1;
            s.continuation_hints += u64::from(continuation);
        });
        id
    }

    fn push_ready(&self, ready: Ready) {
        self.inner.ready.borrow_mut().push_back(ready);
    }

    fn queue_completion(&self, id: u64, op: RawOp, ec: ErrorCode, n: usize, continuation: bool) {
        self.push_ready(Ready::Op {
            id,
            op,
            ec,
            bytes_transferred: n,
            continuation,
        });
    }

    /// Start writing all of `data` to the source `token`.
    ///
    /// Completes with `(Success, data.len())`, or with the socket error and
    /// the number of bytes written before it.
    pub(crate) fn submit_write<H: CompletionHandler>(&self, token: u64, data: Vec<u8>, handler: H) {
        let continuation = handler.is_continuation();
        let op = RawOp::new(handler);

        let mut sources = self.inner.sources.borrow_mut();
        let Some(source) = sources.get_mut(&token) else {
            drop(sources);
            self.reject(OperationType::Write, op, continuation, libc::EBADF);
            return;
        };
        if source.write.is_some() {
            drop(sources);
            self.reject(OperationType::Write, op, continuation, libc::EALREADY);
            return;
        }

        let fd = source.fd;
        let id = self.register_handler_op(OperationType::Write, Some(fd), continuation);
        let mut pending = PendingWrite {
            id,
            continuation,
            op,
            data,
            written: 0,
        };

        match drive_write(fd, &mut pending) {
            Some((ec, n)) => {
                drop(sources);
                tracing::trace!(id, fd, %ec, n, "write finished during submission");
                self.update_stats(|s| s.speculative_completions += 1);
                self.queue_completion(id, pending.op, ec, n, continuation);
            }
            None => {
                tracing::trace!(id, fd, written = pending.written, "write waiting for readiness");
                source.write = Some(pending);
            }
        }
    }

    /// Start reading from the source `token` into `buf` until it contains
    /// `delimiter`.
    ///
    /// Completes with the length of the buffered data up to and including
    /// the first delimiter. End of stream completes with
    /// [`ErrorCode::eof`], exceeding the buffer bound with `ENOBUFS`.
    pub(crate) fn submit_read_until<H: CompletionHandler>(
        &self,
        token: u64,
        buf: &StreamBuf,
        delimiter: u8,
        handler: H,
    ) {
        let continuation = handler.is_continuation();
        let op = RawOp::new(handler);

        let mut sources = self.inner.sources.borrow_mut();
        let Some(source) = sources.get_mut(&token) else {
            drop(sources);
            self.reject(OperationType::ReadUntil, op, continuation, libc::EBADF);
            return;
        };
        if source.read.is_some() {
            drop(sources);
            self.reject(OperationType::ReadUntil, op, continuation, libc::EALREADY);
            return;
        }

        let fd = source.fd;
        let id = self.register_handler_op(OperationType::ReadUntil, Some(fd), continuation);
        let mut pending = PendingRead {
            id,
            continuation,
            op,
            buf: buf.clone(),
            delimiter,
            searched: 0,
            limit: buf.max_size().min(self.inner.config.max_read_size),
        };

        let outcome = drive_read(fd, &mut pending, &mut self.inner.scratch.borrow_mut());
        match outcome {
            Some((ec, n)) => {
                drop(sources);
                tracing::trace!(id, fd, %ec, n, "read finished during submission");
                self.update_stats(|s| s.speculative_completions += 1);
                let PendingRead { op, buf, .. } = pending;
                drop(buf);
                self.queue_completion(id, op, ec, n, continuation);
            }
            None => {
                tracing::trace!(id, fd, buffered = pending.buf.len(), "read waiting for readiness");
                source.read = Some(pending);
            }
        }
    }

    fn reject(&self, op_type: OperationType, op: RawOp, continuation: bool, errno: i32) {
        let id = self.register_handler_op(op_type, None, continuation);
        tracing::debug!(id, %op_type, errno, "operation rejected at submission");
        self.queue_completion(id, op, ErrorCode::Os(errno), 0, continuation);
    }

    /// Queue `f` to run on a later turn.
    pub fn post<F: FnOnce() + 'static>(&self, f: F) {
        let id = self.register_op(OperationType::Post, None, false);
        self.push_ready(Ready::Task { id, f: Box::new(f) });
    }

    /// Queue a completion of `handler` with a fixed result.
    ///
    /// The handler goes through the same allocation, continuation and
    /// invoker hooks as one completed by I/O.
    pub fn post_completion<H: CompletionHandler>(&self, handler: H, ec: ErrorCode, bytes_transferred: usize) {
        let continuation = handler.is_continuation();
        let op = RawOp::new(handler);
        let id = self.register_handler_op(OperationType::Post, None, continuation);
        self.queue_completion(id, op, ec, bytes_transferred, continuation);
    }

    /// Run one turn, blocking until there is something to deliver.
    ///
    /// Returns the number of handlers and closures run. Returns `Ok(0)`
    /// without blocking when nothing is outstanding.
    pub fn run_one(&self) -> Result<usize> {
        self.run_one_timeout(None)
    }

    /// Run one turn without blocking.
    pub fn poll_one(&self) -> Result<usize> {
        self.run_one_timeout(Some(Duration::ZERO))
    }

    /// Run one turn, waiting at most `timeout` for readiness if nothing is
    /// queued (`None` waits indefinitely).
    pub fn run_one_timeout(&self, timeout: Option<Duration>) -> Result<usize> {
        self.update_stats(|s| s.turns += 1);

        let queued = !self.inner.ready.borrow().is_empty();
        if queued {
            self.poll_backend(Some(Duration::ZERO))?;
        } else if self.outstanding() > 0 {
            self.poll_backend(timeout)?;
        } else {
            return Ok(0);
        }

        let dispatched = self.dispatch_ready();
        tracing::trace!(dispatched, outstanding = self.outstanding(), "reactor turn");
        Ok(dispatched)
    }

    /// Run turns until nothing is outstanding.
    ///
    /// Returns the total number of handlers and closures run.
    pub fn run(&self) -> Result<usize> {
        let mut total = 0;
        while self.outstanding() > 0 {
            total += self.run_one()?;
        }
        Ok(total)
    }

    fn poll_backend(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = std::mem::take(&mut *self.inner.events.borrow_mut());
        events.clear();

        let result = self.inner.backend.borrow_mut().wait(timeout, &mut events);
        if let Ok(count) = result {
            self.update_stats(|s| s.readiness_events += count as u64);
            for event in &events {
                self.on_readiness(event);
            }
        }

        *self.inner.events.borrow_mut() = events;
        result.map(|_| ())
    }

    fn on_readiness(&self, event: &Readiness) {
        let mut finished = Vec::new();
        {
            let mut sources = self.inner.sources.borrow_mut();
            let Some(source) = sources.get_mut(&event.token) else {
                return;
            };
            let fd = source.fd;

            if event.writable || event.closed {
                if let Some(mut pending) = source.write.take() {
                    match drive_write(fd, &mut pending) {
                        Some((ec, n)) => {
                            finished.push((pending.id, pending.op, ec, n, pending.continuation));
                        }
                        None => source.write = Some(pending),
                    }
                }
            }

            if event.readable || event.closed {
                if let Some(mut pending) = source.read.take() {
                    let outcome = drive_read(fd, &mut pending, &mut self.inner.scratch.borrow_mut());
                    match outcome {
                        Some((ec, n)) => {
                            let PendingRead {
                                id,
                                op,
                                buf,
                                continuation,
                                ..
                            } = pending;
                            drop(buf);
                            finished.push((id, op, ec, n, continuation));
                        }
                        None => source.read = Some(pending),
                    }
                }
            }
        }

        for (id, op, ec, n, continuation) in finished {
            tracing::trace!(id, %ec, n, "operation finished on readiness");
            self.queue_completion(id, op, ec, n, continuation);
        }
    }

    fn dispatch_ready(&self) -> usize {
        let mut budget = self.inner.ready.borrow().len();
        let mut dispatched = 0;

        loop {
            let next = {
                let mut ready = self.inner.ready.borrow_mut();
                if budget > 0 {
                    budget -= 1;
                    ready.pop_front()
                } else if ready.front().is_some_and(Ready::is_continuation) {
                    ready.pop_front()
                } else {
                    None
                }
            };

            let Some(item) = next else {
                break;
            };
            self.dispatch(item);
            dispatched += 1;
        }

        dispatched
    }

    fn dispatch(&self, item: Ready) {
        match item {
            Ready::Op {
                id,
                op,
                ec,
                bytes_transferred,
                ..
            } => {
                self.inner.tracker.borrow_mut().complete_operation(id);
                self.update_stats(|s| s.completed += 1);
                tracing::trace!(id, %ec, bytes_transferred, "invoking handler");
                op.complete(ec, bytes_transferred);
            }
            Ready::Task { id, f } => {
                self.inner.tracker.borrow_mut().complete_operation(id);
                f();
            }
        }
    }

    /// Destroy every pending operation and queued closure without running
    /// them, and stop watching every source.
    ///
    /// Returns how many operations and closures were discarded. Dropping the
    /// last [`Reactor`] handle does the same.
    pub fn shutdown(&self) -> usize {
        let sources = std::mem::take(&mut *self.inner.sources.borrow_mut());
        let ready = std::mem::take(&mut *self.inner.ready.borrow_mut());
        let discarded = self.inner.tracker.borrow_mut().clear();

        let destroyed = release_sources(&mut **self.inner.backend.borrow_mut(), &sources)
            + queued_ops(&ready);
        self.update_stats(|s| s.destroyed += destroyed as u64);

        if discarded > 0 {
            tracing::warn!(discarded, "reactor shut down with work outstanding");
        }

        drop(sources);
        drop(ready);
        discarded
    }

    /// Snapshot of every operation not yet delivered, ordered by ID.
    pub(crate) fn debug_info(&self) -> Vec<OperationHandle> {
        self.inner.tracker.borrow().debug_info()
    }
}

impl Dispatch for Reactor {
    fn dispatch(&self, f: Box<dyn FnOnce()>) {
        self.post(f);
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("backend", &self.inner.backend.borrow().name())
            .field("sources", &self.inner.sources.borrow().len())
            .field("outstanding", &self.outstanding())
            .field("stats", &self.stats())
            .finish()
    }
}
