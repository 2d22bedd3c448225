//! Length-prefixed record framing.
//!
//! Every frame on the wire — including the plaintext PEM public key and the
//! RSA-wrapped session key during the handshake — is
//! `len:u32_be ‖ payload(len)`. Readers loop until exactly 4 bytes, then
//! exactly `len` bytes, are received; a declared length above [`MAX_RECORD_LEN`]
//! is a protocol violation and terminates the session before any payload
//! allocation happens.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Hard cap on a declared record length: 10 MiB.
pub const MAX_RECORD_LEN: usize = 10 * 1024 * 1024;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors from frame reads and writes.
#[derive(Debug)]
pub enum FrameError {
    /// Underlying socket error. `UnexpectedEof` here means the peer closed
    /// mid-frame — framing is complete-or-nothing, so a partial frame is
    /// never surfaced.
    Io(io::Error),
    /// The peer declared a record longer than [`MAX_RECORD_LEN`].
    Oversize {
        /// Declared length.
        len: usize,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)           => write!(f, "frame I/O: {e}"),
            Self::Oversize { len } => write!(f, "declared record length {len} exceeds {MAX_RECORD_LEN}"),
        }
    }
}
impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

// ─── Reader / Writer ─────────────────────────────────────────────────────────

/// Reads length-prefixed frames from any byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a readable stream.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next complete frame payload.
    pub async fn recv(&mut self) -> Result<Vec<u8>, FrameError> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            return Err(FrameError::Oversize { len });
        }
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(payload)
    }
}

/// Writes length-prefixed frames to any byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writable stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one frame as a single contiguous write (prefix ‖ payload).
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

// ─── FramedStream ────────────────────────────────────────────────────────────

/// A TCP connection speaking length-prefixed frames.
pub struct FramedStream {
    stream: TcpStream,
}

impl FramedStream {
    /// Connect to `addr` with `TCP_NODELAY` set.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Send one frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next complete frame payload.
    pub async fn recv(&mut self) -> Result<Vec<u8>, FrameError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            return Err(FrameError::Oversize { len });
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Split into independently owned read/write halves (splice mode).
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        let (r, w) = self.stream.into_split();
        (FrameReader::new(r), FrameWriter::new(w))
    }

    /// Give the raw stream back.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}
