//! Type-erased handler storage.
//!
//! The reactor keeps pending handlers of many different types in the same
//! queues. [`RawOp`] stores one handler in memory obtained from that
//! handler's own [`allocate`](crate::HandlerHooks::allocate) hook and
//! remembers, through a static vtable, how to finish or destroy it.
//!
//! Finishing follows a fixed order:
//!
//! 1. move the handler out of its storage,
//! 2. return the storage through the moved handler's `deallocate` hook,
//! 3. run `complete` through the handler's [`Invoker`](crate::Invoker).
//!
//! Releasing the storage before the upcall lets the handler reuse the same
//! block for the next operation it starts.

use std::alloc::Layout;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use crate::error::ErrorCode;
use crate::handler::CompletionHandler;

struct OpVTable {
    complete: unsafe fn(NonNull<u8>, ErrorCode, usize),
    destroy: unsafe fn(NonNull<u8>),
}

fn vtable<H: CompletionHandler>() -> &'static OpVTable {
    &OpVTable {
        complete: complete::<H>,
        destroy: destroy::<H>,
    }
}

/// A pending handler living in handler-provided memory.
///
/// Dropping a `RawOp` destroys the handler without invoking it.
pub(crate) struct RawOp {
    ptr: NonNull<u8>,
    layout: Layout,
    vtable: &'static OpVTable,
}

impl RawOp {
    /// Move `handler` into storage obtained from its own allocation hook.
    pub(crate) fn new<H: CompletionHandler>(handler: H) -> Self {
        let layout = Layout::new::<H>();
        let ptr = handler.allocate(layout);
        // SAFETY: allocate returned a block valid for `layout`
        unsafe { ptr.cast::<H>().as_ptr().write(handler) };
        Self {
            ptr,
            layout,
            vtable: vtable::<H>(),
        }
    }

    /// Size in bytes requested from the handler's allocator.
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    /// Release the storage and invoke the handler.
    pub(crate) fn complete(self, ec: ErrorCode, bytes_transferred: usize) {
        let this = ManuallyDrop::new(self);
        // SAFETY: ptr holds an initialised handler of the vtable's type; the
        // ManuallyDrop guard keeps Drop from touching it again
        unsafe { (this.vtable.complete)(this.ptr, ec, bytes_transferred) }
    }
}

impl Drop for RawOp {
    fn drop(&mut self) {
        // SAFETY: ptr holds an initialised handler that was never completed
        unsafe { (self.vtable.destroy)(self.ptr) }
    }
}

impl std::fmt::Debug for RawOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawOp")
            .field("ptr", &self.ptr)
            .field("size", &self.size())
            .finish()
    }
}

unsafe fn take<H: CompletionHandler>(ptr: NonNull<u8>) -> H {
    // SAFETY: caller guarantees ptr holds an initialised H
    let handler = unsafe { ptr.cast::<H>().as_ptr().read() };
    // SAFETY: ptr came from handler.allocate(Layout::new::<H>()) and is no
    // longer referenced after the read above
    unsafe { handler.deallocate(ptr, Layout::new::<H>()) };
    handler
}

unsafe fn complete<H: CompletionHandler>(ptr: NonNull<u8>, ec: ErrorCode, bytes_transferred: usize) {
    // SAFETY: forwarded from RawOp::complete
    let handler = unsafe { take::<H>(ptr) };
    let invoker = handler.invoker();
    invoker.invoke(move || handler.complete(ec, bytes_transferred));
}

unsafe fn destroy<H: CompletionHandler>(ptr: NonNull<u8>) {
    // SAFETY: forwarded from RawOp::drop
    let handler = unsafe { take::<H>(ptr) };
    drop(handler);
}
