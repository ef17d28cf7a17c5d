//! Growable read buffer shared between a caller and the reactor.
//!
//! [`StreamBuf`] is the dynamic buffer that read-until operations append to.
//! The caller keeps one handle and passes the buffer by reference when it
//! starts a read; the reactor clones the handle for the lifetime of that
//! operation and drops its clone before the completion handler runs, so the
//! handler observes the buffer as exclusively its own again.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Default maximum size of a [`StreamBuf`].
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024;

/// Reference-counted growable byte buffer with an upper bound.
///
/// Cloning produces another handle to the same bytes.
#[derive(Clone)]
pub struct StreamBuf {
    data: Rc<RefCell<Vec<u8>>>,
    max_size: usize,
}

impl StreamBuf {
    /// Create an empty buffer bounded by [`DEFAULT_MAX_SIZE`].
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SIZE)
    }

    /// Create an empty buffer that may grow to at most `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(Vec::new())),
            max_size: max_size.max(1),
        }
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// Returns true if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    /// Upper bound on the buffered size.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes that may still be appended before the bound is reached.
    pub fn remaining(&self) -> usize {
        self.max_size.saturating_sub(self.len())
    }

    /// Copy of the buffered bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    /// Remove up to `n` bytes from the front and return them.
    pub fn consume(&self, n: usize) -> Vec<u8> {
        let mut data = self.data.borrow_mut();
        let n = n.min(data.len());
        data.drain(..n).collect()
    }

    /// Number of live handles to this buffer, including `self`.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.data)
    }

    /// Position of `delimiter` at or after `from`.
    pub(crate) fn find(&self, delimiter: u8, from: usize) -> Option<usize> {
        let data = self.data.borrow();
        let from = from.min(data.len());
        data[from..]
            .iter()
            .position(|&b| b == delimiter)
            .map(|pos| from + pos)
    }

    /// Append `bytes`. The caller keeps the total within `max_size`.
    pub(crate) fn extend(&self, bytes: &[u8]) {
        self.data.borrow_mut().extend_from_slice(bytes);
    }
}

impl Default for StreamBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuf")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("handles", &self.handle_count())
            .finish()
    }
}
