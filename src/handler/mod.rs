//! The completion handler protocol.
//!
//! Every completion handler exposes four hooks to the reactor through
//! [`HandlerHooks`]:
//!
//! - [`allocate`](HandlerHooks::allocate) / [`deallocate`](HandlerHooks::deallocate):
//!   storage for the reactor's per-operation bookkeeping. Each successful
//!   allocation is released exactly once, with the same layout, before the
//!   handler runs.
//! - [`is_continuation`](HandlerHooks::is_continuation): whether the handler is
//!   already running as part of an ongoing call chain.
//! - [`invoker`](HandlerHooks::invoker): how the final call is executed.
//!
//! All hooks have defaults, so a plain handler only implements
//! [`CompletionHandler::complete`]. Types that stand in for another handler
//! (composed operations, allocator wrappers) forward every hook to the handler
//! they wrap, which keeps nested composition invisible to the reactor.
//!
//! # Example
//!
//! ```rust
//! use safer_compose::{handler_fn, CompletionHandler, ErrorCode};
//!
//! let handler = handler_fn(|ec: ErrorCode, n: usize| {
//!     assert!(ec.is_ok());
//!     assert_eq!(n, 5);
//! });
//! handler.complete(ErrorCode::Success, 5);
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::ErrorCode;

mod alloc_hooks;


pub use alloc_hooks::{with_allocator, HandlerMemory, MemoryStats, WithAllocator};

/// Hooks the reactor consults on behalf of a completion handler.
pub trait HandlerHooks {
    /// Obtain storage for the reactor's bookkeeping of one operation.
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        default_allocate(layout)
    }

    /// Release storage obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from a call to `allocate` on this handler (or on a
    /// handler sharing its allocation strategy) with the same `layout`, and
    /// must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract
        unsafe { default_deallocate(ptr, layout) }
    }

    /// Whether this handler is already executing as a continuation of an
    /// ongoing operation.
    fn is_continuation(&self) -> bool {
        false
    }

    /// The strategy used to run this handler's final call.
    fn invoker(&self) -> Invoker {
        Invoker::Inline
    }
}

/// A one-shot callback invoked when an asynchronous operation finishes.
///
/// `complete` consumes the handler, so a second invocation cannot be written.
pub trait CompletionHandler: HandlerHooks + Sized + 'static {
    /// Deliver the result of the operation.
    fn complete(self, ec: ErrorCode, bytes_transferred: usize);
}

/// Heap allocation used when a handler does not provide its own.
///
/// Zero-sized layouts get a well-aligned dangling pointer.
pub fn default_allocate(layout: Layout) -> NonNull<u8> {
    if layout.size() == 0 {
        return dangling_for(layout);
    }
    // SAFETY: layout has non-zero size
    let ptr = unsafe { alloc::alloc(layout) };
    NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout))
}

/// Release memory obtained from [`default_allocate`].
///
/// # Safety
///
/// `ptr` must have been returned by `default_allocate(layout)` and not freed.
pub unsafe fn default_deallocate(ptr: NonNull<u8>, layout: Layout) {
    if layout.size() != 0 {
        // SAFETY: caller guarantees ptr came from alloc with this layout
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

fn dangling_for(layout: Layout) -> NonNull<u8> {
    // Alignment is a non-zero power of two, so this is never null.
    NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling())
}

/// Something that can run a boxed closure later.
pub trait Dispatch {
    /// Arrange for `f` to run.
    fn dispatch(&self, f: Box<dyn FnOnce()>);
}

/// How a handler's final call is executed.
#[derive(Clone, Default)]
pub enum Invoker {
    /// Run the call immediately on the current stack.
    #[default]
    Inline,
    /// Hand the call to a dispatcher, e.g. to re-post it through a reactor.
    Dispatch(Rc<dyn Dispatch>),
}

impl Invoker {
    /// Run `f` according to this strategy.
    pub fn invoke<F: FnOnce() + 'static>(self, f: F) {
        match self {
            Invoker::Inline => f(),
            Invoker::Dispatch(dispatcher) => dispatcher.dispatch(Box::new(f)),
        }
    }

    /// Returns true for [`Invoker::Inline`].
    pub fn is_inline(&self) -> bool {
        matches!(self, Invoker::Inline)
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invoker::Inline => f.write_str("Inline"),
            Invoker::Dispatch(_) => f.write_str("Dispatch(..)"),
        }
    }
}

/// Completion handler built from a closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure as a [`CompletionHandler`] using the default hooks.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnOnce(ErrorCode, usize) + 'static,
{
    FnHandler { f }
}

impl<F> HandlerHooks for FnHandler<F> {}

impl<F> CompletionHandler for FnHandler<F>
where
    F: FnOnce(ErrorCode, usize) + 'static,
{
    fn complete(self, ec: ErrorCode, bytes_transferred: usize) {
        (self.f)(ec, bytes_transferred)
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}
