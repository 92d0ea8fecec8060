//! Inbound transport: where frames come from.
//!
//! The router only sees [`Transport`] and [`FrameSource`]; framing, sockets and timeouts stay
//! here. The shipped implementation reads newline-delimited JSON over TCP.

use log::debug;
use std::fmt::{self, Display, Formatter};
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Nothing arrived within the read timeout.
    Idle,
    /// The peer closed the connection cleanly.
    Closed,
}

#[derive(Debug)]
pub enum TransportError {
    Connect(String),
    Io(io::Error),
    FrameTooLarge(usize),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(s) => write!(f, "connect failed: {}", s),
            TransportError::Io(e) => write!(f, "io error: {}", e),
            TransportError::FrameTooLarge(n) => write!(f, "frame exceeds {} bytes", n),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        TransportError::Io(value)
    }
}

/// One live connection.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, TransportError>;

    fn close(&mut self) {}
}

/// Knows how to open connections; called again on every reconnect.
pub trait Transport: Send {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, TransportError>;

    fn describe(&self) -> String;
}

pub struct TcpLineTransport {
    addr: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpLineTransport {
    /// `read_timeout` bounds how long a read blocks, which is how quickly a stop is noticed.
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        TcpLineTransport {
            addr: addr.into(),
            connect_timeout,
            read_timeout,
        }
    }
}

impl Transport for TcpLineTransport {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, TransportError> {
        let addrs = self
            .addr
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect(format!("resolve {}: {}", self.addr, e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_nodelay(true)?;
                    let shutdown_handle = stream.try_clone()?;
                    debug!("TCP connection established to {}", addr);
                    return Ok(Box::new(TcpLineSource {
                        reader: BufReader::new(stream),
                        shutdown_handle,
                        pending: Vec::new(),
                    }));
                }
                Err(e) => last_err = Some(format!("{}: {}", addr, e)),
            }
        }
        Err(TransportError::Connect(
            last_err.unwrap_or_else(|| format!("{} resolved to no addresses", self.addr)),
        ))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

struct TcpLineSource {
    reader: BufReader<TcpStream>,
    shutdown_handle: TcpStream,
    /// Bytes of a line that has not been terminated yet; survives read timeouts.
    pending: Vec<u8>,
}

impl TcpLineSource {
    fn take_line(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&bytes).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

impl FrameSource for TcpLineSource {
    fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    // EOF: flush an unterminated last line before reporting the close
                    return Ok(match self.take_line() {
                        Some(line) => Frame::Text(line),
                        None => Frame::Closed,
                    });
                }
                Ok(_) => {
                    if self.pending.last() != Some(&b'\n') {
                        continue;
                    }
                    if let Some(line) = self.take_line() {
                        return Ok(Frame::Text(line));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if self.pending.len() > MAX_FRAME_BYTES {
                        return Err(TransportError::FrameTooLarge(MAX_FRAME_BYTES));
                    }
                    return Ok(Frame::Idle);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
            if self.pending.len() > MAX_FRAME_BYTES {
                return Err(TransportError::FrameTooLarge(MAX_FRAME_BYTES));
            }
        }
    }

    fn close(&mut self) {
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);
    }
}
