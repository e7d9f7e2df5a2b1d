/*! Byte channels the transport runs over.

The transport needs a duplex, non-blocking byte pipe. Implementations
here cover a TCP client (for serial-over-network bridges) and an
in-memory loopback pair used by tests and demos. A USB CDC serial port
fits the same trait through any serial crate that exposes non-blocking
reads.
*/
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::{Error, Result};

/// A duplex byte stream with non-blocking reads.
///
/// `read` may return fewer bytes than asked for, including zero when
/// nothing is pending. Any I/O failure is surfaced as [`Error::Io`],
/// which makes the transport worker run its reconnect sequence.
pub trait ByteChannel: Send {
    /// (Re)open the channel.
    fn open(&mut self) -> Result<()>;
    /// Close the channel. Harmless when already closed.
    fn close(&mut self) -> Result<()>;
    /// Read up to `buf.len()` bytes without blocking.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Write some bytes, returning how many were taken.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    /// How many bytes a `read` would currently return, at minimum.
    fn bytes_available(&mut self) -> Result<usize>;
}

/// TCP client byte channel, for serial bridges like `ser2net`.
pub struct TcpChannel {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpChannel {
    /// Create an unopened channel for `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> TcpChannel {
        TcpChannel {
            addr: addr.into(),
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Io(ErrorKind::NotConnected.into()))
    }
}

impl ByteChannel for TcpChannel {
    fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        info!("connected to {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!("closed connection to {}", self.addr);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream()?.read(buf) {
            Ok(0) if !buf.is_empty() => Err(Error::Io(ErrorKind::UnexpectedEof.into())),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.stream()?.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let mut peek = [0u8; 1];
        match self.stream()?.peek(&mut peek) {
            Ok(0) => Err(Error::Io(ErrorKind::UnexpectedEof.into())),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
struct LoopbackQueue {
    bytes: Mutex<VecDeque<u8>>,
}

/// One end of an in-memory loopback pair.
///
/// Whatever one end writes, the other end reads. Never errors while
/// open, which makes it a convenient transport harness.
pub struct LoopbackChannel {
    rx: Arc<LoopbackQueue>,
    tx: Arc<LoopbackQueue>,
    open: bool,
}

/// Create a crossed pair of in-memory channels.
#[must_use]
pub fn loopback_pair() -> (LoopbackChannel, LoopbackChannel) {
    let a = Arc::new(LoopbackQueue::default());
    let b = Arc::new(LoopbackQueue::default());
    (
        LoopbackChannel {
            rx: a.clone(),
            tx: b.clone(),
            open: true,
        },
        LoopbackChannel {
            rx: b,
            tx: a,
            open: true,
        },
    )
}

impl ByteChannel for LoopbackChannel {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::Io(ErrorKind::NotConnected.into()));
        }
        let mut q = self.rx.bytes.lock().unwrap();
        let n = buf.len().min(q.len());
        for b in buf.iter_mut().take(n) {
            *b = q.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::Io(ErrorKind::NotConnected.into()));
        }
        self.tx.bytes.lock().unwrap().extend(buf);
        Ok(buf.len())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        if !self.open {
            return Err(Error::Io(ErrorKind::NotConnected.into()));
        }
        Ok(self.rx.bytes.lock().unwrap().len())
    }
}
