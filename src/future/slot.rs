//! One-shot pending result slot.
//!
//! [`pending_slot`] returns the two halves of a slot: the [`Completer`] is
//! moved into a completion handler, the [`Pending`] future is awaited by the
//! fiber that started the operation. The slot is created before the
//! operation starts, so a completion can never arrive before anyone is
//! listening for it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::error::ErrorCode;
use crate::sync::{lock, Arc, Mutex};

#[derive(Debug, Default)]
struct SlotState {
    result: Option<(ErrorCode, usize)>,
    waker: Option<Waker>,
    /// Set once the completer is gone, filled or not
    closed: bool,
}

/// Create a connected [`Completer`] / [`Pending`] pair.
pub fn pending_slot() -> (Completer, Pending) {
    let shared = Arc::new(Mutex::new(SlotState::default()));
    (
        Completer {
            shared: Arc::clone(&shared),
            filled: false,
        },
        Pending { shared },
    )
}

/// Write half of a pending slot.
///
/// Dropping it unfilled resolves the [`Pending`] half to `None`.
#[derive(Debug)]
pub struct Completer {
    shared: Arc<Mutex<SlotState>>,
    filled: bool,
}

impl Completer {
    /// Fill the slot and wake the waiting task.
    pub fn complete(mut self, ec: ErrorCode, bytes_transferred: usize) {
        self.filled = true;
        self.close(Some((ec, bytes_transferred)));
    }

    fn close(&self, result: Option<(ErrorCode, usize)>) {
        let waker = {
            let mut state = lock(&self.shared);
            if result.is_some() {
                state.result = result;
            }
            state.closed = true;
            state.waker.take()
        };
        // Wake outside the lock.
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.filled {
            tracing::debug!("pending slot abandoned");
            self.close(None);
        }
    }
}

/// Read half of a pending slot.
///
/// Resolves to the delivered result, or `None` if the completer was dropped
/// without delivering one.
#[derive(Debug)]
pub struct Pending {
    shared: Arc<Mutex<SlotState>>,
}

impl Pending {
    /// Returns true once the slot can no longer be filled.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }
}

impl Future for Pending {
    type Output = Option<(ErrorCode, usize)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.shared);

        if let Some(result) = state.result.take() {
            return Poll::Ready(Some(result));
        }
        if state.closed {
            return Poll::Ready(None);
        }

        match &state.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}
