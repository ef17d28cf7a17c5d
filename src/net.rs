//! Reactor-driven streams.
//!
//! [`AsyncStream`] is the capability composed operations are written
//! against: a cloneable handle that can start one write and one
//! read-until-delimiter at a time. [`TcpStream`] implements it on top of a
//! non-blocking socket registered with a [`Reactor`].

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use crate::buffer::StreamBuf;
use crate::error::Result;
use crate::handler::CompletionHandler;
use crate::reactor::{Reactor, WeakReactor};

/// A bidirectional byte stream with asynchronous primitives.
///
/// Each operation invokes its handler exactly once, from a reactor turn
/// after the initiating call has returned, honouring the handler's hooks.
/// At most one write and one read may be pending per stream; a second
/// concurrent one completes with `EALREADY`.
pub trait AsyncStream: Clone + 'static {
    /// Write all of `data`.
    ///
    /// Completes with `(Success, data.len())` or with the error and the
    /// number of bytes written before it.
    fn async_write<H: CompletionHandler>(&self, data: Vec<u8>, handler: H);

    /// Read into `buf` until it contains `delimiter`.
    ///
    /// Completes with the number of bytes up to and including the first
    /// delimiter, which stay in `buf`; on error the count is zero.
    fn async_read_until<H: CompletionHandler>(&self, buf: &StreamBuf, delimiter: u8, handler: H);

    /// The reactor this stream's completions are delivered on, or `None`
    /// once every handle to it has been dropped.
    ///
    /// Streams must not keep the reactor alive: a pending operation owns its
    /// handler, which may own the stream.
    fn reactor(&self) -> Option<Reactor>;
}

struct StreamInner {
    std: std::net::TcpStream,
    token: u64,
    reactor: WeakReactor,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        // Deregister before the socket itself is closed.
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.deregister(self.token);
        }
    }
}

/// A non-blocking TCP stream registered with a reactor.
///
/// Cloning yields another handle to the same socket; the socket is
/// deregistered and closed when the last handle is dropped.
#[derive(Clone)]
pub struct TcpStream {
    inner: Rc<StreamInner>,
}

impl TcpStream {
    /// Connect to `addr` and register the socket with `reactor`.
    ///
    /// The connect itself is blocking; every later operation is not.
    pub fn connect<A: ToSocketAddrs>(reactor: &Reactor, addr: A) -> Result<Self> {
        let std = std::net::TcpStream::connect(addr)?;
        Self::from_std(reactor, std)
    }

    /// Register an already connected socket with `reactor`.
    pub fn from_std(reactor: &Reactor, std: std::net::TcpStream) -> Result<Self> {
        std.set_nonblocking(true)?;
        std.set_nodelay(true)?;
        let token = reactor.register_fd(std.as_raw_fd())?;
        tracing::debug!(
            peer = ?std.peer_addr().ok(),
            token,
            "stream connected"
        );

        Ok(Self {
            inner: Rc::new(StreamInner {
                std,
                token,
                reactor: reactor.downgrade(),
            }),
        })
    }

    /// Shut down one or both directions of the connection.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.std.shutdown(how)
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.std.local_addr()
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.std.peer_addr()
    }

    /// Number of live handles to this stream.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

impl TcpStream {
    fn with_reactor<H: CompletionHandler>(&self, handler: H, submit: impl FnOnce(&Reactor, H)) {
        match self.inner.reactor.upgrade() {
            Some(reactor) => submit(&reactor, handler),
            None => {
                tracing::warn!(token = self.inner.token, "reactor dropped; operation discarded");
                drop(handler);
            }
        }
    }
}

impl AsyncStream for TcpStream {
    fn async_write<H: CompletionHandler>(&self, data: Vec<u8>, handler: H) {
        let token = self.inner.token;
        self.with_reactor(handler, |reactor, handler| {
            reactor.submit_write(token, data, handler);
        });
    }

    fn async_read_until<H: CompletionHandler>(&self, buf: &StreamBuf, delimiter: u8, handler: H) {
        let token = self.inner.token;
        self.with_reactor(handler, |reactor, handler| {
            reactor.submit_read_until(token, buf, delimiter, handler);
        });
    }

    fn reactor(&self) -> Option<Reactor> {
        self.inner.reactor.upgrade()
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream")
            .field("fd", &self.inner.std.as_raw_fd())
            .field("token", &self.inner.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::handler::handler_fn;
    use std::cell::Cell;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn write_then_read_line() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(&reactor, listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());

        let wrote = Rc::new(Cell::new(None));
        let slot = Rc::clone(&wrote);
        stream.async_write(
            b"ping\n".to_vec(),
            handler_fn(move |ec, n| slot.set(Some((ec, n)))),
        );
        reactor.run().unwrap();
        assert_eq!(wrote.get(), Some((ErrorCode::Success, 5)));

        let mut reader = BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "ping\n");
        reader.get_mut().write_all(b"pong\n").unwrap();

        let buf = StreamBuf::new();
        let read = Rc::new(Cell::new(None));
        let slot = Rc::clone(&read);
        stream.async_read_until(&buf, b'\n', handler_fn(move |ec, n| slot.set(Some((ec, n)))));
        while read.get().is_none() {
            reactor
                .run_one_timeout(Some(Duration::from_millis(10)))
                .unwrap();
        }
        assert_eq!(read.get(), Some((ErrorCode::Success, 5)));
        assert_eq!(buf.to_vec(), b"pong\n");
    }

    #[test]
    fn dropping_last_handle_deregisters() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(&reactor, listener.local_addr().unwrap()).unwrap();
        let clone = stream.clone();
        assert_eq!(stream.handle_count(), 2);

        drop(stream);
        let ran = Rc::new(Cell::new(None));
        let slot = Rc::clone(&ran);
        clone.async_write(b"x".to_vec(), handler_fn(move |ec, n| slot.set(Some((ec, n)))));
        reactor.run().unwrap();
        assert!(ran.get().unwrap().0.is_ok());

        let token = clone.inner.token;
        drop(clone);

        let rejected = Rc::new(Cell::new(None));
        let slot = Rc::clone(&rejected);
        reactor.submit_write(token, b"x".to_vec(), handler_fn(move |ec, n| slot.set(Some((ec, n)))));
        reactor.run().unwrap();
        assert_eq!(rejected.get(), Some((ErrorCode::Os(libc::EBADF), 0)));
    }
}
