//! epoll-based readiness backend.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::backend::{Backend, Readiness};
use crate::error::{ComposeError, Result};

const INTEREST: u32 =
    (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32;

/// Edge-triggered epoll backend.
#[derive(Debug)]
pub struct EpollBackend {
    epoll_fd: RawFd,
    buffer: Vec<libc::epoll_event>,
}

impl EpollBackend {
    /// Create a new epoll instance reporting up to `max_events` per wait.
    pub fn new(max_events: usize) -> Result<Self> {
        // SAFETY: plain syscall, result checked below
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(ComposeError::Io(io::Error::last_os_error()));
        }

        let mut buffer = Vec::with_capacity(max_events.max(1));
        buffer.resize_with(max_events.max(1), || libc::epoll_event { events: 0, u64: 0 });

        Ok(Self { epoll_fd, buffer })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: Option<&mut libc::epoll_event>) -> Result<()> {
        let event_ptr = match event {
            Some(event) => event as *mut libc::epoll_event,
            None => std::ptr::null_mut(),
        };
        // SAFETY: epoll_fd is owned by self; event_ptr is null or valid
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, event_ptr) };
        if result == -1 {
            return Err(ComposeError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // SAFETY: epoll_fd is owned by self and closed exactly once
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

impl Backend for EpollBackend {
    fn register(&mut self, fd: RawFd, token: u64) -> Result<()> {
        let mut event = libc::epoll_event {
            events: INTEREST,
            u64: token,
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(&mut event))
    }

    fn deregister(&mut self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Readiness>) -> Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(timeout) => {
                // Round up so that a sub-millisecond timeout still sleeps.
                let ms = timeout.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as i32
            }
        };

        // SAFETY: buffer holds buffer.len() initialised epoll_event slots
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.buffer.as_mut_ptr(),
                self.buffer.len() as i32,
                timeout_ms,
            )
        };

        if num_events == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(ComposeError::Io(err));
        }

        for event in &self.buffer[..num_events as usize] {
            let flags = event.events;
            events.push(Readiness {
                token: event.u64,
                readable: flags & (libc::EPOLLIN as u32) != 0,
                writable: flags & (libc::EPOLLOUT as u32) != 0,
                closed: flags
                    & ((libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLERR) as u32)
                    != 0,
            });
        }

        Ok(num_events as usize)
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}
