//! Fiber driver: synchronous-looking test bodies on top of the reactor.
//!
//! A fiber is a future polled by the [`Driver`]. Inside it, an operation
//! started with [`UseFiber`](crate::future::UseFiber) is simply awaited; the
//! fiber suspends at that point and resumes once the operation's handler
//! fills the pending slot. The driver alternates between polling woken
//! fibers and running reactor turns.
//!
//! ```no_run
//! use safer_compose::{run_composed_echo, Driver, ErrorCode, Reactor, TcpStream};
//! use safer_compose::testing::EchoServer;
//!
//! # fn main() -> safer_compose::Result<()> {
//! let server = EchoServer::start()?;
//! let reactor = Reactor::new()?;
//! let stream = TcpStream::connect(&reactor, server.local_addr())?;
//!
//! let result = Driver::new(&reactor).yield_to(async {
//!     run_composed_echo(&stream, "Hello, world!\n").await
//! })?;
//! assert_eq!(result, (ErrorCode::Success, 14));
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Waker};
use std::time::Instant;

use crate::config::DriverConfig;
use crate::error::{ComposeError, Result};
use crate::reactor::Reactor;

mod waker;

use waker::{FiberWaker, ReadyQueue};

/// A fiber body.
pub type FiberBody<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

struct Fiber<'a> {
    body: FiberBody<'a>,
    wake: Arc<FiberWaker>,
    waker: Waker,
}

/// Runs fibers against a reactor until they finish.
#[derive(Debug, Clone)]
pub struct Driver {
    reactor: Reactor,
    config: DriverConfig,
}

impl Driver {
    /// Create a driver with the default configuration.
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            reactor: reactor.clone(),
            config: DriverConfig::default(),
        }
    }

    /// Create a driver with `config`.
    pub fn with_config(reactor: &Reactor, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            reactor: reactor.clone(),
            config,
        })
    }

    /// The reactor this driver runs.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Run `body` as a fiber and return its output.
    ///
    /// # Errors
    ///
    /// [`ComposeError::Stalled`] if the fiber waits for something the reactor
    /// can no longer deliver, [`ComposeError::Timeout`] if the configured
    /// deadline passes, or a reactor error.
    pub fn yield_to<'a, F>(&self, body: F) -> Result<F::Output>
    where
        F: Future + 'a,
    {
        let output = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&output);
        let fiber: FiberBody<'a> = Box::pin(async move {
            let value = body.await;
            *slot.borrow_mut() = Some(value);
        });
        self.run(vec![fiber])?;

        let value = output.borrow_mut().take();
        value.ok_or(ComposeError::Abandoned)
    }

    /// Run every body as an independent fiber until all of them finish.
    ///
    /// Fibers interleave only where they await. On error the remaining
    /// fibers are dropped.
    pub fn yield_to_all<'a, I>(&self, bodies: I) -> Result<()>
    where
        I: IntoIterator<Item = FiberBody<'a>>,
    {
        self.run(bodies.into_iter().collect())
    }

    fn run<'a>(&self, bodies: Vec<FiberBody<'a>>) -> Result<()> {
        let queue = Arc::new(ReadyQueue::new());
        let mut fibers: Vec<Option<Fiber<'a>>> = bodies
            .into_iter()
            .enumerate()
            .map(|(index, body)| {
                let wake = FiberWaker::new(index, &queue);
                let waker = wake.waker();
                Some(Fiber { body, wake, waker })
            })
            .collect();

        let mut live = fibers.len();
        let started = Instant::now();
        tracing::debug!(fibers = live, "driver started");

        while live > 0 {
            if let Some(deadline) = self.config.deadline {
                if started.elapsed() >= deadline {
                    tracing::warn!(fibers = live, ?deadline, "driver deadline exceeded");
                    return Err(ComposeError::Timeout(deadline));
                }
            }

            let ready = queue.drain();
            if ready.is_empty() {
                if self.reactor.outstanding() == 0 {
                    tracing::warn!(
                        fibers = live,
                        pending = ?self.reactor.debug_info(),
                        "fibers suspended with nothing left to resume them"
                    );
                    return Err(ComposeError::Stalled { fibers: live });
                }
                self.reactor
                    .run_one_timeout(Some(self.config.poll_interval))?;
                continue;
            }

            for index in ready {
                let Some(fiber) = fibers.get_mut(index).and_then(Option::as_mut) else {
                    continue;
                };
                fiber.wake.clear();

                let mut cx = Context::from_waker(&fiber.waker);
                if fiber.body.as_mut().poll(&mut cx).is_ready() {
                    tracing::trace!(fiber = index, "fiber finished");
                    fibers[index] = None;
                    live -= 1;
                }
            }
        }

        tracing::debug!(elapsed = ?started.elapsed(), "driver finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::future::{pending_slot, CompletionToken, UseFiber};
    use crate::handler::handler_fn;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn runs_body_without_io() {
        let reactor = Reactor::new().unwrap();
        let driver = Driver::new(&reactor);
        assert_eq!(driver.yield_to(async { 7 }).unwrap(), 7);
    }

    #[test]
    fn resumes_when_handler_completes() {
        let reactor = Reactor::new().unwrap();
        let driver = Driver::new(&reactor);

        let result = driver
            .yield_to(async {
                let (handler, result) = UseFiber.into_handler();
                reactor.post_completion(handler, ErrorCode::Success, 9);
                result.await
            })
            .unwrap();
        assert_eq!(result.unwrap(), 9);
    }

    #[test]
    fn fibers_interleave_at_suspension_points() {
        let reactor = Reactor::new().unwrap();
        let driver = Driver::new(&reactor);
        let order = Rc::new(RefCell::new(Vec::new()));

        let body = |name: &'static str| -> FiberBody<'static> {
            let order = Rc::clone(&order);
            let reactor = reactor.clone();
            Box::pin(async move {
                order.borrow_mut().push(name);
                let (handler, result) = UseFiber.redirect_error().into_handler();
                reactor.post_completion(handler, ErrorCode::Success, 0);
                result.await;
                order.borrow_mut().push(name);
            })
        };

        driver.yield_to_all([body("a"), body("b")]).unwrap();
        assert_eq!(*order.borrow(), vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn unfillable_slot_stalls() {
        let reactor = Reactor::new().unwrap();
        let driver = Driver::new(&reactor);
        let (completer, pending) = pending_slot();

        let err = driver.yield_to(pending).unwrap_err();
        assert!(matches!(err, ComposeError::Stalled { fibers: 1 }));
        drop(completer);
    }

    #[test]
    fn deadline_is_enforced() {
        let reactor = Reactor::new().unwrap();
        let driver = Driver::with_config(
            &reactor,
            DriverConfig {
                poll_interval: Duration::from_millis(5),
                deadline: Some(Duration::from_millis(30)),
            },
        )
        .unwrap();

        // Keeps the reactor busy without ever waking the fiber.
        fn spin(reactor: Reactor, stop: Rc<Cell<bool>>) {
            if stop.get() {
                return;
            }
            let again = reactor.clone();
            reactor.post(move || spin(again, stop));
        }
        let stop = Rc::new(Cell::new(false));
        spin(reactor.clone(), Rc::clone(&stop));

        let (_completer, pending) = pending_slot();
        let err = driver.yield_to(pending).unwrap_err();
        assert!(matches!(err, ComposeError::Timeout(_)));

        stop.set(true);
        reactor.run().unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let reactor = Reactor::new().unwrap();
        let config = DriverConfig {
            poll_interval: Duration::ZERO,
            deadline: None,
        };
        assert!(Driver::with_config(&reactor, config).is_err());
    }

    #[test]
    fn dropped_handler_abandons_fiber_result() {
        let reactor = Reactor::new().unwrap();
        let driver = Driver::new(&reactor);

        let result = driver
            .yield_to(async {
                let (handler, result) = UseFiber.into_handler();
                reactor.post(move || drop(handler));
                result.await
            })
            .unwrap();
        assert!(matches!(result, Err(ComposeError::Abandoned)));

        let seen = Rc::new(Cell::new(false));
        let flag = Rc::clone(&seen);
        reactor.post_completion(handler_fn(move |_, _| flag.set(true)), ErrorCode::Success, 0);
        reactor.run().unwrap();
        assert!(seen.get());
    }
}
