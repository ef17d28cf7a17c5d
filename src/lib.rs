//! # Safer-Compose: composed asynchronous operations that keep their promises
//!
//! A composed operation chains several primitive asynchronous operations
//! behind one completion handler. To the reactor it must look exactly like a
//! primitive operation: its per-operation storage comes from the handler's
//! allocator, it reports the right continuation hint, the final call goes
//! through the handler's invoker, and the handler runs exactly once.
//!
//! ## Key Features
//!
//! ### Handler protocol
//! - **Allocation symmetry**: every [`allocate`](HandlerHooks::allocate) is
//!   matched by one [`deallocate`](HandlerHooks::deallocate) with the same
//!   layout, before the handler runs
//! - **Exactly-once invocation**: [`CompletionHandler::complete`] consumes
//!   the handler
//! - **Continuation hints** and custom **invokers**, forwarded through every
//!   layer of composition
//!
//! ### Type-level enforcement
//! A composed operation holds its handler as a [`FinalHandler`], which is not
//! a [`CompletionHandler`]. Handing the wrapped handler to a suboperation in
//! place of the operation itself is a compile error rather than a bug that
//! shows up as a lost completion.
//!
//! ### Synchronous-looking tests
//! The [`Driver`] runs test bodies as fibers. Operations started with
//! [`UseFiber`] are awaited like ordinary calls while the reactor delivers
//! their completions underneath.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use safer_compose::testing::EchoServer;
//! use safer_compose::{run_composed_echo, Driver, ErrorCode, Reactor, TcpStream};
//!
//! # fn main() -> safer_compose::Result<()> {
//! let server = EchoServer::start()?;
//! let reactor = Reactor::new()?;
//! let stream = TcpStream::connect(&reactor, server.local_addr())?;
//!
//! let (ec, n) = Driver::new(&reactor).yield_to(async {
//!     run_composed_echo(&stream, "Hello, world!\n").await
//! })?;
//! assert_eq!((ec, n), (ErrorCode::Success, 14));
//! assert_eq!(server.join()?, b"Hello, world!\n");
//! # Ok(())
//! # }
//! ```
//!
//! ### Explicit handlers
//!
//! ```rust,no_run
//! use safer_compose::testing::EchoServer;
//! use safer_compose::{async_echo, handler_fn, Reactor, TcpStream};
//!
//! # fn main() -> safer_compose::Result<()> {
//! let server = EchoServer::start()?;
//! let reactor = Reactor::new()?;
//! let stream = TcpStream::connect(&reactor, server.local_addr())?;
//!
//! async_echo(&stream, "ping\n", handler_fn(|ec, n| {
//!     println!("echo finished: {ec} after {n} bytes");
//! }));
//! reactor.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! The reactor and every handler live on one thread. Only the pending result
//! slot behind [`UseFiber`] may be completed from another thread.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core modules - the handler protocol and the operations built on it
pub mod compose; // Composed operations and FinalHandler
pub mod error;
pub mod handler; // Completion handler hooks
pub mod operation; // Reactor-side operation storage

// Runtime - reactor, transport and fibers
pub mod backend; // Readiness backends (epoll)
pub mod buffer;
pub mod fiber; // Fiber driver
pub mod future; // Completion tokens
pub mod net;
pub mod reactor;

// Support
pub mod config;
pub mod logging;
pub mod testing; // Mock peer and instrumentation

mod sync;

// Re-exports for convenience - commonly used types at crate root
pub use buffer::StreamBuf;
pub use compose::{async_echo, async_echo_with_buffer, run_composed_echo, EchoOp, FinalHandler};
pub use config::{Config, ConfigBuilder, DriverConfig, LoggingConfig, ReactorConfig};
pub use error::{ComposeError, ErrorCode, Result};
pub use fiber::{Driver, FiberBody};
pub use future::{
    pending_slot, CompletionToken, FiberHandler, FiberResult, RedirectError, RedirectResult, UseFiber,
};
pub use handler::{
    handler_fn, with_allocator, CompletionHandler, Dispatch, FnHandler, HandlerHooks,
    HandlerMemory, Invoker, MemoryStats, WithAllocator,
};
pub use logging::LogLevel;
pub use net::{AsyncStream, TcpStream};
pub use operation::OperationType;
pub use reactor::{Reactor, ReactorStats, WeakReactor};
