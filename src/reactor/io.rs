//! Non-blocking socket I/O for registered sources.
//!
//! Each source has at most one pending write and one pending read. The
//! `drive_*` functions push a pending operation as far as the socket allows
//! and report a completion once there is one to deliver.

use std::io;
use std::os::unix::io::RawFd;

use crate::buffer::StreamBuf;
use crate::error::ErrorCode;
use crate::operation::raw::RawOp;

/// A registered file descriptor and its pending operations.
#[derive(Debug)]
pub(super) struct IoSource {
    pub(super) fd: RawFd,
    pub(super) write: Option<PendingWrite>,
    pub(super) read: Option<PendingRead>,
}

impl IoSource {
    pub(super) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            write: None,
            read: None,
        }
    }

    /// Number of operations still waiting on this source.
    pub(super) fn pending(&self) -> usize {
        usize::from(self.write.is_some()) + usize::from(self.read.is_some())
    }
}

#[derive(Debug)]
pub(super) struct PendingWrite {
    pub(super) id: u64,
    pub(super) continuation: bool,
    pub(super) op: RawOp,
    pub(super) data: Vec<u8>,
    pub(super) written: usize,
}

#[derive(Debug)]
pub(super) struct PendingRead {
    pub(super) id: u64,
    pub(super) continuation: bool,
    pub(super) op: RawOp,
    pub(super) buf: StreamBuf,
    pub(super) delimiter: u8,
    /// Prefix of `buf` already known not to contain the delimiter
    pub(super) searched: usize,
    /// Effective size bound for `buf`
    pub(super) limit: usize,
}

/// Write as much of `pending` as the socket accepts.
///
/// Returns `None` while the socket would block.
pub(super) fn drive_write(fd: RawFd, pending: &mut PendingWrite) -> Option<(ErrorCode, usize)> {
    while pending.written < pending.data.len() {
        let rest = &pending.data[pending.written..];
        // SAFETY: rest is a live slice of rest.len() bytes
        let rc = unsafe {
            libc::send(
                fd,
                rest.as_ptr().cast::<libc::c_void>(),
                rest.len(),
                libc::MSG_NOSIGNAL,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return None,
                io::ErrorKind::Interrupted => continue,
                _ => return Some((ErrorCode::from(&err), pending.written)),
            }
        }

        pending.written += rc as usize;
    }

    Some((ErrorCode::Success, pending.written))
}

/// Read into `pending.buf` until it contains the delimiter.
///
/// `scratch` is reused between calls to avoid an allocation per `recv`.
/// Returns `None` while the socket would block.
pub(super) fn drive_read(
    fd: RawFd,
    pending: &mut PendingRead,
    scratch: &mut [u8],
) -> Option<(ErrorCode, usize)> {
    loop {
        if let Some(pos) = pending.buf.find(pending.delimiter, pending.searched) {
            return Some((ErrorCode::Success, pos + 1));
        }
        pending.searched = pending.buf.len();

        let room = pending.limit.saturating_sub(pending.buf.len());
        if room == 0 {
            return Some((ErrorCode::Os(libc::ENOBUFS), 0));
        }

        let len = room.min(scratch.len());
        let chunk = &mut scratch[..len];
        // SAFETY: chunk is a live, writable slice of chunk.len() bytes
        let rc = unsafe { libc::recv(fd, chunk.as_mut_ptr().cast::<libc::c_void>(), chunk.len(), 0) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return None,
                io::ErrorKind::Interrupted => continue,
                _ => return Some((ErrorCode::from(&err), 0)),
            }
        }

        if rc == 0 {
            return Some((ErrorCode::eof(), 0));
        }

        pending.buf.extend(&chunk[..rc as usize]);
    }
}
