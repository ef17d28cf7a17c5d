//! Instrumented handlers that record how the reactor treats them.

use std::alloc::Layout;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::ErrorCode;
use crate::handler::{
    default_allocate, default_deallocate, CompletionHandler, Dispatch, HandlerHooks, Invoker,
};

/// Summary of everything a [`HandlerLedger`] has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerReport {
    /// Successful `allocate` calls
    pub allocations: u64,
    /// `deallocate` calls, including rejected ones
    pub deallocations: u64,
    /// Blocks allocated and not yet freed
    pub live: usize,
    /// Frees whose size differed from the allocation
    pub size_mismatches: u64,
    /// Frees of pointers that were never allocated or already freed
    pub unknown_frees: u64,
    /// Handler invocations
    pub invocations: u64,
    /// `is_continuation` queries
    pub continuation_queries: u64,
    /// `is_continuation` queries answered with false
    pub non_continuation_answers: u64,
    /// `invoker` requests
    pub invoker_requests: u64,
    /// Calls run through a custom invoker
    pub dispatched: u64,
}

#[derive(Default)]
struct LedgerState {
    live: HashMap<usize, Layout>,
    results: Vec<(ErrorCode, usize)>,
    report: LedgerReport,
}

/// Shared record of allocations, frees and invocations.
///
/// Cloning yields another handle to the same record.
#[derive(Clone, Default)]
pub struct HandlerLedger {
    state: Rc<RefCell<LedgerState>>,
}

impl HandlerLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler that reports into this ledger and then runs `f`.
    pub fn handler<F>(&self, f: F) -> InstrumentedHandler<F>
    where
        F: FnOnce(ErrorCode, usize) + 'static,
    {
        InstrumentedHandler {
            ledger: self.clone(),
            continuation: false,
            invoker: None,
            f,
        }
    }

    /// Snapshot of the counters.
    pub fn report(&self) -> LedgerReport {
        let state = self.state.borrow();
        LedgerReport {
            live: state.live.len(),
            ..state.report
        }
    }

    /// Every `(error, bytes_transferred)` pair delivered, in order.
    pub fn results(&self) -> Vec<(ErrorCode, usize)> {
        self.state.borrow().results.clone()
    }

    /// Number of handler invocations.
    pub fn invocations(&self) -> u64 {
        self.state.borrow().report.invocations
    }

    /// Every allocation was freed exactly once with its own size.
    pub fn is_balanced(&self) -> bool {
        let report = self.report();
        report.live == 0
            && report.size_mismatches == 0
            && report.unknown_frees == 0
            && report.allocations == report.deallocations
    }

    fn update(&self, f: impl FnOnce(&mut LedgerState)) {
        f(&mut self.state.borrow_mut());
    }
}

impl fmt::Debug for HandlerLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerLedger").field(&self.report()).finish()
    }
}

/// A completion handler that records every hook call in a [`HandlerLedger`].
pub struct InstrumentedHandler<F> {
    ledger: HandlerLedger,
    continuation: bool,
    invoker: Option<Rc<dyn Dispatch>>,
    f: F,
}

impl<F> InstrumentedHandler<F> {
    /// Answer `is_continuation` with `continuation`.
    pub fn with_continuation(mut self, continuation: bool) -> Self {
        self.continuation = continuation;
        self
    }

    /// Run the final call through `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: Rc<dyn Dispatch>) -> Self {
        self.invoker = Some(dispatcher);
        self
    }
}

struct CountingDispatch {
    ledger: HandlerLedger,
    inner: Rc<dyn Dispatch>,
}

impl Dispatch for CountingDispatch {
    fn dispatch(&self, f: Box<dyn FnOnce()>) {
        self.ledger.update(|s| s.report.dispatched += 1);
        self.inner.dispatch(f);
    }
}

impl<F> HandlerHooks for InstrumentedHandler<F> {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        let ptr = default_allocate(layout);
        self.ledger.update(|s| {
            s.report.allocations += 1;
            s.live.insert(ptr.as_ptr() as usize, layout);
        });
        ptr
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let recorded = {
            let mut state = self.ledger.state.borrow_mut();
            state.report.deallocations += 1;
            let recorded = state.live.remove(&(ptr.as_ptr() as usize));
            match recorded {
                None => state.report.unknown_frees += 1,
                Some(original) if original.size() != layout.size() => {
                    state.report.size_mismatches += 1;
                }
                Some(_) => {}
            }
            recorded
        };

        match recorded {
            // SAFETY: the block came from default_allocate(original) and is
            // removed from the live set, so it is freed exactly once
            Some(original) => unsafe { default_deallocate(ptr, original) },
            None => tracing::warn!(?ptr, "free of unknown block skipped"),
        }
    }

    fn is_continuation(&self) -> bool {
        let continuation = self.continuation;
        self.ledger.update(|s| {
            s.report.continuation_queries += 1;
            s.report.non_continuation_answers += u64::from(!continuation);
        });
        continuation
    }

    fn invoker(&self) -> Invoker {
        self.ledger.update(|s| s.report.invoker_requests += 1);
        match &self.invoker {
            None => Invoker::Inline,
            Some(inner) => Invoker::Dispatch(Rc::new(CountingDispatch {
                ledger: self.ledger.clone(),
                inner: Rc::clone(inner),
            })),
        }
    }
}

impl<F> CompletionHandler for InstrumentedHandler<F>
where
    F: FnOnce(ErrorCode, usize) + 'static,
{
    fn complete(self, ec: ErrorCode, bytes_transferred: usize) {
        self.ledger.update(|s| {
            s.report.invocations += 1;
            s.results.push((ec, bytes_transferred));
        });
        (self.f)(ec, bytes_transferred);
    }
}

impl<F> fmt::Debug for InstrumentedHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedHandler")
            .field("continuation", &self.continuation)
            .field("dispatch", &self.invoker.is_some())
            .finish_non_exhaustive()
    }
}
