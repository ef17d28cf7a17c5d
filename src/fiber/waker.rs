//! Ready queue for fibers.
//!
//! Every fiber gets a waker that pushes the fiber's index onto a shared
//! queue. A fiber is queued at most once until the driver polls it again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Waker;

use futures::task::ArcWake;

/// Indices of fibers that were woken since the driver last looked.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    ready: Mutex<VecDeque<usize>>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&self, fiber: usize) {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(fiber);
    }

    /// Take every queued index, in wake order.
    pub(crate) fn drain(&self) -> Vec<usize> {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Wake handle for one fiber.
#[derive(Debug)]
pub(crate) struct FiberWaker {
    fiber: usize,
    queued: AtomicBool,
    queue: Arc<ReadyQueue>,
}

impl FiberWaker {
    /// Create the waker for `fiber`, initially queued so that it gets its
    /// first poll.
    pub(crate) fn new(fiber: usize, queue: &Arc<ReadyQueue>) -> Arc<Self> {
        queue.push(fiber);
        Arc::new(Self {
            fiber,
            queued: AtomicBool::new(true),
            queue: Arc::clone(queue),
        })
    }

    /// Allow the fiber to be queued again. Called right before it is polled.
    pub(crate) fn clear(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        futures::task::waker(Arc::clone(self))
    }
}

impl ArcWake for FiberWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::AcqRel) {
            arc_self.queue.push(arc_self.fiber);
        }
    }
}
