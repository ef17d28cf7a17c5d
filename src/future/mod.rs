//! Completion tokens: choosing how an operation delivers its result.
//!
//! Initiating functions such as [`async_echo`](crate::compose::async_echo)
//! accept a [`CompletionToken`] instead of a concrete handler. The token
//! produces the handler the operation is started with and the value the
//! initiating function returns:
//!
//! | Token | Handler | Returned |
//! |-------|---------|----------|
//! | any [`CompletionHandler`] | the handler itself | `()` |
//! | [`UseFiber`] | [`FiberHandler`] | [`FiberResult`], a future of `Result<usize>` |
//! | [`RedirectError`] | [`FiberHandler`] | [`RedirectResult`], a future of `(ErrorCode, usize)` |
//!
//! The futures only make progress while something drives the reactor, which
//! is what the [fiber driver](crate::fiber::Driver) does.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{ComposeError, ErrorCode, Result};
use crate::handler::{CompletionHandler, HandlerHooks};

mod slot;


pub use slot::{pending_slot, Completer, Pending};

/// Something an initiating function can turn into a completion handler.
pub trait CompletionToken {
    /// Handler the operation is started with.
    type Handler: CompletionHandler;
    /// Value returned by the initiating function.
    type Output;

    /// Produce the handler and the initiating function's return value.
    fn into_handler(self) -> (Self::Handler, Self::Output);
}

impl<H: CompletionHandler> CompletionToken for H {
    type Handler = H;
    type Output = ();

    fn into_handler(self) -> (H, ()) {
        (self, ())
    }
}

/// Token for awaiting an operation from inside a fiber.
///
/// The operation's error code is raised as [`ComposeError::Operation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UseFiber;

impl UseFiber {
    /// Receive the error code as data instead.
    pub fn redirect_error(self) -> RedirectError {
        RedirectError
    }
}

/// Token for awaiting an operation from inside a fiber, receiving the error
/// code as data.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectError;

/// Handler that fills a pending slot.
#[derive(Debug)]
pub struct FiberHandler {
    completer: Completer,
}

impl FiberHandler {
    /// Wrap the write half of a pending slot.
    pub fn new(completer: Completer) -> Self {
        Self { completer }
    }
}

impl HandlerHooks for FiberHandler {}

impl CompletionHandler for FiberHandler {
    fn complete(self, ec: ErrorCode, bytes_transferred: usize) {
        self.completer.complete(ec, bytes_transferred);
    }
}

impl CompletionToken for UseFiber {
    type Handler = FiberHandler;
    type Output = FiberResult;

    fn into_handler(self) -> (FiberHandler, FiberResult) {
        let (completer, pending) = pending_slot();
        (FiberHandler::new(completer), FiberResult { pending })
    }
}

impl CompletionToken for RedirectError {
    type Handler = FiberHandler;
    type Output = RedirectResult;

    fn into_handler(self) -> (FiberHandler, RedirectResult) {
        let (completer, pending) = pending_slot();
        (FiberHandler::new(completer), RedirectResult { pending })
    }
}

/// Result of an operation started with [`UseFiber`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct FiberResult {
    pending: Pending,
}

impl Future for FiberResult {
    type Output = Result<usize>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.pending).poll(cx).map(|result| match result {
            Some((ec, n)) if ec.is_ok() => Ok(n),
            Some((ec, n)) => Err(ComposeError::from_completion(ec, n)),
            None => Err(ComposeError::Abandoned),
        })
    }
}

/// Result of an operation started with [`RedirectError`].
///
/// An abandoned operation reports [`ErrorCode::aborted`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct RedirectResult {
    pending: Pending,
}

impl Future for RedirectResult {
    type Output = (ErrorCode, usize);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.pending)
            .poll(cx)
            .map(|result| result.unwrap_or((ErrorCode::aborted(), 0)))
    }
}
