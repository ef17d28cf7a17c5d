//! Reactor-side bookkeeping for pending operations.
//!
//! - [`OperationType`]: what kind of operation is pending
//! - `RawOp`: a handler stored in memory from its own allocation hook
//! - `OperationTracker`: the set of operations whose handler is still owed a
//!   call

pub mod types;

pub(crate) mod raw;
pub(crate) mod tracker;

pub use types::OperationType;
