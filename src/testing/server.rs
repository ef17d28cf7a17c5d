//! Mock echo server.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{ComposeError, Result};

/// How long the server waits for the line before giving up.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A background thread that echoes one line back to one client.
///
/// The server binds an ephemeral loopback port, accepts exactly one
/// connection, reads until `\n`, writes back exactly the bytes it read,
/// then shuts the connection down in both directions.
#[derive(Debug)]
pub struct EchoServer {
    addr: SocketAddr,
    thread: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl EchoServer {
    /// Bind `127.0.0.1:0` and start serving.
    pub fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let thread = thread::Builder::new()
            .name("echo-server".into())
            .spawn(move || serve(listener))?;
        tracing::debug!(%addr, "echo server listening");

        Ok(Self {
            addr,
            thread: Some(thread),
        })
    }

    /// Address clients should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the server to finish and return the bytes it echoed.
    ///
    /// # Errors
    ///
    /// [`ComposeError::Peer`] if any step of the exchange failed.
    pub fn join(mut self) -> Result<Vec<u8>> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| ComposeError::Peer("echo server already joined".into()))?;

        match thread.join() {
            Ok(Ok(echoed)) => Ok(echoed),
            Ok(Err(err)) => Err(ComposeError::Peer(err.to_string())),
            Err(_) => Err(ComposeError::Peer("echo server thread panicked".into())),
        }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if !thread.is_finished() {
            // Unblock a pending accept; the server then fails its read.
            let _ = TcpStream::connect(self.addr);
        }
        let _ = thread.join();
    }
}

fn serve(listener: TcpListener) -> io::Result<Vec<u8>> {
    let (stream, peer) = listener.accept()?;
    tracing::debug!(%peer, "echo server accepted connection");
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    if line.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed after {} bytes without a line", line.len()),
        ));
    }

    let mut stream = reader.into_inner();
    stream.write_all(&line)?;
    stream.shutdown(Shutdown::Both)?;
    tracing::debug!(%peer, bytes = line.len(), "echo server finished");
    Ok(line)
}
