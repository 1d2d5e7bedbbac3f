use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer connection during the handshake phase.
///
/// Once both handshakes are on the wire the transport splits into a
/// [`FrameReader`] and [`FrameWriter`] so the receive and send tasks can
/// own their halves independently. Bytes read past the handshake are
/// carried over into the reader.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(HANDSHAKE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = timeout(HANDSHAKE_TIMEOUT, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Splits the connection into its two directions.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                half: read_half,
                buf: self.read_buf,
            },
            FrameWriter { half: write_half },
        )
    }
}

/// The receive direction: reassembles length-prefixed frames.
///
/// Reads do not time out here; idle-connection policy belongs to the
/// session watchdog, which keepalives and eventually kills the trio.
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Reads the next complete frame, returning the decoded message and
    /// the number of wire bytes it occupied.
    pub async fn next_frame(&mut self) -> Result<(Message, usize), PeerError> {
        while self.buf.len() < 4 {
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "message too large: {}",
                length
            )));
        }

        let total = 4 + length;
        while self.buf.len() < total {
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let frame = self.buf.split_to(total);
        Ok((Message::decode(frame.freeze())?, total))
    }
}

/// The send direction: writes whole frames.
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    /// Writes one frame and returns the number of bytes put on the wire.
    pub async fn write_frame(&mut self, message: &Message) -> Result<usize, PeerError> {
        let data = message.encode();
        self.write_raw(&data).await?;
        Ok(data.len())
    }

    /// Writes pre-encoded frame bytes. The send task encodes first so it
    /// can charge the rate gate before touching the socket.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.half.write_all(data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
