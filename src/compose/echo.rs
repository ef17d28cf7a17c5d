//! The echo operation: write a payload, then read back one line.
//!
//! | Phase | Reached when | Action |
//! |-------|--------------|--------|
//! | `Start` | the operation is started | write the payload |
//! | `Wrote` | the write succeeded | read until `\n` |
//! | `Read` | the read succeeded | finish |
//! | `Done` | finished, or any step failed | invoke the wrapped handler |
//!
//! The phase is advanced before the suboperation it names is issued, and the
//! operation moves itself into that suboperation as its handler. A failing
//! step finishes immediately with the error and the transfer count the
//! failing suboperation reported.

use std::alloc::Layout;
use std::fmt;
use std::future::Future;
use std::ptr::NonNull;

use crate::buffer::{StreamBuf, DEFAULT_MAX_SIZE};
use crate::compose::FinalHandler;
use crate::error::ErrorCode;
use crate::future::{CompletionToken, UseFiber};
use crate::handler::{CompletionHandler, HandlerHooks, Invoker};
use crate::net::AsyncStream;

/// Line delimiter the echo operation reads up to.
pub const DELIMITER: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Start,
    Wrote,
    Read,
    Done,
}

struct EchoState<S, H: CompletionHandler> {
    handler: FinalHandler<H>,
    stream: S,
    buffer: StreamBuf,
    payload: String,
    phase: Phase,
}

/// A running echo operation.
///
/// Only ever observed by the reactor, as the handler of its own
/// suboperations.
pub struct EchoOp<S: AsyncStream, H: CompletionHandler> {
    state: Box<EchoState<S, H>>,
}

impl<S: AsyncStream, H: CompletionHandler> EchoOp<S, H> {
    /// Start echoing `payload` over `stream`, reading the reply into a fresh
    /// buffer. `handler` receives the final result.
    pub fn start(stream: S, payload: impl Into<String>, handler: H) {
        let max_size = stream
            .reactor()
            .map_or(DEFAULT_MAX_SIZE, |reactor| reactor.config().max_read_size);
        let buffer = StreamBuf::with_max_size(max_size);
        Self::start_with_buffer(stream, payload, buffer, handler);
    }

    /// Like [`start`](Self::start), reading the reply into `buffer`.
    pub fn start_with_buffer(stream: S, payload: impl Into<String>, buffer: StreamBuf, handler: H) {
        let op = Self {
            state: Box::new(EchoState {
                handler: FinalHandler::new(handler),
                stream,
                buffer,
                payload: payload.into(),
                phase: Phase::Start,
            }),
        };
        op.step(ErrorCode::Success, 0);
    }

    fn step(mut self, ec: ErrorCode, bytes_transferred: usize) {
        tracing::trace!(phase = ?self.state.phase, %ec, bytes_transferred, "echo step");

        if ec.is_err() {
            self.finish(ec, bytes_transferred);
            return;
        }

        match self.state.phase {
            Phase::Start => {
                self.state.phase = Phase::Wrote;
                let stream = self.state.stream.clone();
                let data = self.state.payload.clone().into_bytes();
                stream.async_write(data, self);
            }
            Phase::Wrote => {
                self.state.phase = Phase::Read;
                let stream = self.state.stream.clone();
                let buffer = self.state.buffer.clone();
                stream.async_read_until(&buffer, DELIMITER, self);
            }
            Phase::Read | Phase::Done => self.finish(ec, bytes_transferred),
        }
    }

    fn finish(mut self, ec: ErrorCode, bytes_transferred: usize) {
        let from = std::mem::replace(&mut self.state.phase, Phase::Done);
        tracing::trace!(?from, %ec, bytes_transferred, "echo done");

        let EchoState {
            handler,
            stream,
            buffer,
            payload,
            ..
        } = *self.state;

        // Release the operation state before the upcall.
        drop((stream, buffer, payload));
        handler.complete(ec, bytes_transferred);
    }
}

impl<S: AsyncStream, H: CompletionHandler> HandlerHooks for EchoOp<S, H> {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.state.handler.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract
        unsafe { self.state.handler.deallocate(ptr, layout) }
    }

    fn is_continuation(&self) -> bool {
        // Past Start the operation is re-entered from one of its own steps.
        self.state.phase != Phase::Start || self.state.handler.is_continuation()
    }

    fn invoker(&self) -> Invoker {
        self.state.handler.invoker()
    }
}

impl<S: AsyncStream, H: CompletionHandler> CompletionHandler for EchoOp<S, H> {
    fn complete(self, ec: ErrorCode, bytes_transferred: usize) {
        self.step(ec, bytes_transferred);
    }
}

impl<S: AsyncStream, H: CompletionHandler> fmt::Debug for EchoOp<S, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoOp")
            .field("phase", &self.state.phase)
            .field("payload_len", &self.state.payload.len())
            .field("buffered", &self.state.buffer.len())
            .finish()
    }
}

/// Echo `payload` over `stream`, delivering the result according to `token`.
///
/// With a plain handler this returns `()`; with [`UseFiber`] it returns a
/// future to await inside a fiber.
pub fn async_echo<S, T>(stream: &S, payload: impl Into<String>, token: T) -> T::Output
where
    S: AsyncStream,
    T: CompletionToken,
{
    let (handler, output) = token.into_handler();
    EchoOp::start(stream.clone(), payload, handler);
    output
}

/// Like [`async_echo`], reading the reply into `buffer` so that the caller
/// can inspect it afterwards.
pub fn async_echo_with_buffer<S, T>(
    stream: &S,
    payload: impl Into<String>,
    buffer: &StreamBuf,
    token: T,
) -> T::Output
where
    S: AsyncStream,
    T: CompletionToken,
{
    let (handler, output) = token.into_handler();
    EchoOp::start_with_buffer(stream.clone(), payload, buffer.clone(), handler);
    output
}

/// Echo `payload` from inside a fiber, returning the error code as data.
pub fn run_composed_echo<S: AsyncStream>(
    stream: &S,
    payload: impl Into<String>,
) -> impl Future<Output = (ErrorCode, usize)> {
    async_echo(stream, payload, UseFiber.redirect_error())
}
