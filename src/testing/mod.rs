//! Test support: a mock peer, instrumented handlers and a scripted stream.
//!
//! - [`EchoServer`]: background thread that echoes one line back
//! - [`HandlerLedger`] / [`InstrumentedHandler`]: record every hook call a
//!   handler receives, to check allocation symmetry, exactly-once
//!   invocation and continuation hints
//! - [`ScriptedStream`]: an [`AsyncStream`](crate::AsyncStream) whose
//!   operations complete from a script, to reach failure paths on demand

mod ledger;
mod scripted;
mod server;

pub use ledger::{HandlerLedger, InstrumentedHandler, LedgerReport};
pub use scripted::{ScriptedStream, Step};
pub use server::{EchoServer, READ_TIMEOUT};
