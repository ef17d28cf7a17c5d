//! Recycling storage for handler allocations.
//!
//! A composed operation issues its suboperations one after another, and each
//! one asks its handler for a block of roughly the same size. [`HandlerMemory`]
//! keeps a single block alive for the lifetime of the handler chain and hands
//! it out whenever it is free, falling back to the heap otherwise.

use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use super::{default_allocate, default_deallocate, CompletionHandler, HandlerHooks, Invoker};
use crate::error::ErrorCode;

/// Size of the recycled block in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Alignment of the recycled block.
pub const BLOCK_ALIGN: usize = 64;

/// Usage counters for a [`HandlerMemory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Allocations served from the recycled block
    pub hits: u64,
    /// Allocations that fell back to the heap
    pub misses: u64,
    /// Blocks currently handed out (recycled or heap)
    pub live: u64,
}

struct MemoryInner {
    block: NonNull<u8>,
    layout: Layout,
    in_use: Cell<bool>,
    stats: Cell<MemoryStats>,
}

impl MemoryInner {
    fn update(&self, f: impl FnOnce(&mut MemoryStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        if self.in_use.get() {
            // A handler still owns the block; leaking it is the only sound option.
            tracing::warn!("handler memory dropped while its block is in use");
            return;
        }
        // SAFETY: block was allocated with self.layout in HandlerMemory::with_capacity
        unsafe { default_deallocate(self.block, self.layout) }
    }
}

/// Single-block recycling allocator shared by a chain of handlers.
///
/// Cloning shares the same block.
#[derive(Clone)]
pub struct HandlerMemory {
    inner: Rc<MemoryInner>,
}

impl HandlerMemory {
    /// Create memory with a [`DEFAULT_BLOCK_SIZE`] block.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BLOCK_SIZE)
    }

    /// Create memory with a block of `size` bytes (at least one).
    pub fn with_capacity(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(1), BLOCK_ALIGN)
            .unwrap_or_else(|_| Layout::new::<[u8; DEFAULT_BLOCK_SIZE]>());
        Self {
            inner: Rc::new(MemoryInner {
                block: default_allocate(layout),
                layout,
                in_use: Cell::new(false),
                stats: Cell::new(MemoryStats::default()),
            }),
        }
    }

    /// Capacity of the recycled block.
    pub fn capacity(&self) -> usize {
        self.inner.layout.size()
    }

    /// Whether the recycled block is currently handed out.
    pub fn in_use(&self) -> bool {
        self.inner.in_use.get()
    }

    /// Snapshot of the usage counters.
    pub fn stats(&self) -> MemoryStats {
        self.inner.stats.get()
    }

    /// Allocate `layout`, preferring the recycled block.
    pub fn allocate(&self, layout: Layout) -> NonNull<u8> {
        let inner = &self.inner;
        let fits = layout.size() <= inner.layout.size() && layout.align() <= inner.layout.align();
        if fits && !inner.in_use.get() {
            inner.in_use.set(true);
            inner.update(|s| {
                s.hits += 1;
                s.live += 1;
            });
            return inner.block;
        }
        inner.update(|s| {
            s.misses += 1;
            s.live += 1;
        });
        default_allocate(layout)
    }

    /// Release memory obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(layout)` on this memory (or a clone of
    /// it) and must not have been released already.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let inner = &self.inner;
        inner.update(|s| s.live = s.live.saturating_sub(1));
        if ptr == inner.block {
            inner.in_use.set(false);
            return;
        }
        // SAFETY: not the recycled block, so it came from default_allocate
        unsafe { default_deallocate(ptr, layout) }
    }
}

impl Default for HandlerMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMemory")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handler wrapper that routes allocations through a [`HandlerMemory`].
///
/// Continuation and invocation hooks are forwarded to the wrapped handler.
#[derive(Debug)]
pub struct WithAllocator<H> {
    memory: HandlerMemory,
    handler: H,
}

/// Attach `memory` to `handler`.
pub fn with_allocator<H: CompletionHandler>(memory: &HandlerMemory, handler: H) -> WithAllocator<H> {
    WithAllocator {
        memory: memory.clone(),
        handler,
    }
}

impl<H: CompletionHandler> HandlerHooks for WithAllocator<H> {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.memory.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract; allocate always goes through self.memory
        unsafe { self.memory.deallocate(ptr, layout) }
    }

    fn is_continuation(&self) -> bool {
        self.handler.is_continuation()
    }

    fn invoker(&self) -> Invoker {
        self.handler.invoker()
    }
}

impl<H: CompletionHandler> CompletionHandler for WithAllocator<H> {
    fn complete(self, ec: ErrorCode, bytes_transferred: usize) {
        self.handler.complete(ec, bytes_transferred)
    }
}
