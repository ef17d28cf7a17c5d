//! Composed asynchronous operations.
//!
//! A composed operation chains several primitive operations behind a single
//! completion handler. While it runs, the operation itself is the handler of
//! each suboperation it issues: it forwards the wrapped handler's hooks to
//! the reactor, advances its own phase when a suboperation completes, and
//! invokes the wrapped handler exactly once at the end.
//!
//! The wrapped handler is held as a [`FinalHandler`]. A `FinalHandler` can
//! report the wrapped handler's hooks and complete it, but it is not itself a
//! [`CompletionHandler`] and cannot be unwrapped, so it can never be handed
//! to a suboperation in place of the composed operation:
//!
//! ```compile_fail
//! use safer_compose::compose::FinalHandler;
//! use safer_compose::{handler_fn, AsyncStream, StreamBuf, TcpStream};
//!
//! fn substitute(stream: &TcpStream, buf: &StreamBuf) {
//!     let handler = FinalHandler::new(handler_fn(|_, _| {}));
//!     stream.async_read_until(buf, b'\n', handler);
//! }
//! ```

use std::alloc::Layout;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use crate::error::ErrorCode;
use crate::handler::{CompletionHandler, Invoker};

pub mod echo;

pub use echo::{async_echo, async_echo_with_buffer, run_composed_echo, EchoOp};

/// The user handler captured by a composed operation.
///
/// Dropping a `FinalHandler` without completing it is a protocol violation
/// and is reported through `tracing`.
pub struct FinalHandler<H: CompletionHandler> {
    handler: ManuallyDrop<H>,
}

impl<H: CompletionHandler> FinalHandler<H> {
    /// Capture `handler` for a composed operation.
    pub fn new(handler: H) -> Self {
        Self {
            handler: ManuallyDrop::new(handler),
        }
    }

    /// Forwarded [`allocate`](crate::HandlerHooks::allocate) hook.
    pub fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.handler.allocate(layout)
    }

    /// Forwarded [`deallocate`](crate::HandlerHooks::deallocate) hook.
    ///
    /// # Safety
    ///
    /// Same contract as [`HandlerHooks::deallocate`](crate::HandlerHooks::deallocate).
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract
        unsafe { self.handler.deallocate(ptr, layout) }
    }

    /// Continuation hint of the wrapped handler.
    pub fn is_continuation(&self) -> bool {
        self.handler.is_continuation()
    }

    /// Invoker of the wrapped handler.
    pub fn invoker(&self) -> Invoker {
        self.handler.invoker()
    }

    /// Invoke the wrapped handler.
    pub fn complete(self, ec: ErrorCode, bytes_transferred: usize) {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the handler is taken exactly once
        let handler = unsafe { ManuallyDrop::take(&mut this.handler) };
        handler.complete(ec, bytes_transferred);
    }
}

impl<H: CompletionHandler> Drop for FinalHandler<H> {
    fn drop(&mut self) {
        tracing::warn!(
            handler = std::any::type_name::<H>(),
            "completion handler dropped without being invoked"
        );
        // SAFETY: complete() forgets self, so the handler is still present here
        unsafe { ManuallyDrop::drop(&mut self.handler) }
    }
}

impl<H: CompletionHandler> fmt::Debug for FinalHandler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalHandler")
            .field("handler", &std::any::type_name::<H>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerHooks};
    use std::cell::Cell;
    use std::rc::Rc;

    struct Flagged {
        invoked: Rc<Cell<u32>>,
        dropped: Rc<Cell<bool>>,
    }

    impl HandlerHooks for Flagged {
        fn is_continuation(&self) -> bool {
            true
        }
    }

    impl CompletionHandler for Flagged {
        fn complete(self, _ec: ErrorCode, _n: usize) {
            self.invoked.set(self.invoked.get() + 1);
        }
    }

    impl Drop for Flagged {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    #[test]
    fn forwards_hooks_and_completes_once() {
        let invoked = Rc::new(Cell::new(0));
        let dropped = Rc::new(Cell::new(false));
        let handler = FinalHandler::new(Flagged {
            invoked: Rc::clone(&invoked),
            dropped: Rc::clone(&dropped),
        });

        assert!(handler.is_continuation());
        assert!(handler.invoker().is_inline());

        let layout = Layout::new::<u64>();
        let ptr = handler.allocate(layout);
        unsafe { handler.deallocate(ptr, layout) };

        handler.complete(ErrorCode::Success, 1);
        assert_eq!(invoked.get(), 1);
        assert!(dropped.get());
    }

    #[test]
    fn drop_without_completion_still_drops_handler() {
        let invoked = Rc::new(Cell::new(0));
        let dropped = Rc::new(Cell::new(false));
        let handler = FinalHandler::new(Flagged {
            invoked: Rc::clone(&invoked),
            dropped: Rc::clone(&dropped),
        });

        drop(handler);
        assert_eq!(invoked.get(), 0);
        assert!(dropped.get());
    }

    #[test]
    fn debug_names_wrapped_type() {
        let handler = FinalHandler::new(handler_fn(|_, _| {}));
        assert!(format!("{handler:?}").contains("FnHandler"));
        handler.complete(ErrorCode::Success, 0);
    }
}
