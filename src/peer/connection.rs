//! Framed TCP transport for the peer coordination channel.
//!
//! Each frame is a 4-byte big-endian length prefix followed by the frame
//! body ([`crate::protocol::Frame`]). Reads are bounded by
//! [`MAX_FRAME_SIZE`] so a corrupt prefix can never allocate unbounded
//! memory, and by a caller-supplied timeout so a stalled peer cannot pin
//! the connection task forever.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// One framed connection to a peer, either accepted or dialed.
pub struct PeerConnection {
    stream: TcpStream,
    addr: SocketAddr,
    compress: bool,
}

impl PeerConnection {
    /// Dial a peer's coordination listener.
    pub async fn connect(addr: &str, compress: bool) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::IoError(e.kind()))?;
        // Heartbeats are tiny and latency-sensitive
        stream
            .set_nodelay(true)
            .map_err(|e| Error::IoError(e.kind()))?;
        let addr = stream.peer_addr().map_err(|e| Error::IoError(e.kind()))?;
        Ok(Self {
            stream,
            addr,
            compress,
        })
    }

    /// Wrap an accepted stream.
    pub fn accepted(stream: TcpStream, addr: SocketAddr, compress: bool) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            addr,
            compress,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Read one frame, failing if nothing complete arrives in time.
    pub async fn read_frame(&mut self, read_timeout: Duration) -> Result<Frame> {
        let body = match timeout(read_timeout, self.read_body()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    peer = %self.addr,
                    timeout_ms = read_timeout.as_millis() as u64,
                    "Frame read timeout"
                );
                return Err(Error::MissingData("Frame read timeout".to_owned()));
            }
        };
        Frame::parse(body)
    }

    /// Write one frame, then read the peer's reply.
    pub async fn call(&mut self, frame: &Frame, read_timeout: Duration) -> Result<Frame> {
        self.write_frame(frame).await?;
        self.read_frame(read_timeout).await
    }

    async fn read_body(&mut self) -> Result<Bytes> {
        // 4-byte size prefix
        let mut size_buf = [0u8; 4];
        let mut bytes_read = 0;

        loop {
            self.stream
                .readable()
                .await
                .map_err(|e| Error::IoError(e.kind()))?;

            match self.stream.try_read(&mut size_buf[bytes_read..]) {
                Ok(0) => {
                    return Err(Error::MissingData("Connection closed".to_owned()));
                }
                Ok(n) => {
                    bytes_read += n;
                    if bytes_read == 4 {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    continue;
                }
                Err(e) => {
                    return Err(Error::IoError(e.kind()));
                }
            }
        }

        let size = (&size_buf[..]).get_u32() as usize;
        if size > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(size));
        }

        tracing::trace!("Reading {} bytes from {}", size, self.addr);

        let mut data = vec![0u8; size];
        let mut bytes_read = 0;

        while bytes_read < size {
            self.stream
                .readable()
                .await
                .map_err(|e| Error::IoError(e.kind()))?;

            match self.stream.try_read(&mut data[bytes_read..]) {
                Ok(0) => {
                    return Err(Error::MissingData("Connection closed mid-frame".to_owned()));
                }
                Ok(n) => {
                    bytes_read += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    continue;
                }
                Err(e) => {
                    return Err(Error::IoError(e.kind()));
                }
            }
        }

        Ok(Bytes::from(data))
    }

    /// Write one frame with its length prefix.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let wire = frame.encode_with_size(self.compress)?;

        let mut bytes_written = 0;
        while bytes_written < wire.len() {
            self.stream
                .writable()
                .await
                .map_err(|e| Error::IoError(e.kind()))?;

            match self.stream.try_write(&wire[bytes_written..]) {
                Ok(n) => {
                    bytes_written += n;
                    tracing::trace!("Wrote {} bytes to {}", n, self.addr);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    continue;
                }
                Err(e) => {
                    return Err(Error::IoError(e.kind()));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.addr)
            .field("compress", &self.compress)
            .finish()
    }
}
