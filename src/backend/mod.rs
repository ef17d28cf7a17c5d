//! Readiness backends for the reactor.
//!
//! The reactor performs the actual reads and writes itself; a backend only
//! reports when a registered file descriptor may have become readable or
//! writable. Registrations are edge-triggered, so the reactor always drives a
//! socket until it would block before waiting on it again.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;

#[cfg(target_os = "linux")]
pub mod epoll;

/// Readiness reported for one registered file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Token supplied at registration
    pub token: u64,
    /// Data (or a pending EOF) can be read
    pub readable: bool,
    /// Data can be written
    pub writable: bool,
    /// The peer hung up or the socket reported an error
    pub closed: bool,
}

/// Trait for readiness backends.
///
/// # Safety Notes
///
/// File descriptors passed to [`register`](Backend::register) stay owned by
/// the caller; they must remain open until [`deregister`](Backend::deregister)
/// has been called for them.
pub trait Backend {
    /// Start reporting readiness of `fd` under `token`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the descriptor cannot be registered.
    fn register(&mut self, fd: RawFd, token: u64) -> Result<()>;

    /// Stop reporting readiness of `fd`.
    fn deregister(&mut self, fd: RawFd) -> Result<()>;

    /// Wait for readiness events, appending them to `events`.
    ///
    /// `None` blocks until at least one event arrives; `Some(Duration::ZERO)`
    /// returns immediately. Returns the number of events appended; an
    /// interrupted wait reports zero events.
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Readiness>) -> Result<usize>;

    /// Get backend name for debugging.
    fn name(&self) -> &'static str;
}

/// Create the backend for the current platform.
///
/// # Errors
///
/// Returns `Unsupported` on platforms without epoll.
pub fn detect_backend(max_events: usize) -> Result<Box<dyn Backend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollBackend::new(max_events)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = max_events;
        Err(crate::error::ComposeError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "no readiness backend available on this platform",
        )))
    }
}
