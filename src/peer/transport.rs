use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::{HANDSHAKE_LEN, WRITE_TIMEOUT};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Any byte stream a peer session can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A type-erased [`PeerStream`], used for connections handed in from outside.
pub type BoxedStream = Box<dyn PeerStream>;

/// Framed reads and writes of peer wire messages over a byte stream.
///
/// Reads are cancel safe: bytes already pulled off the stream stay in the
/// internal buffer when a `receive_*` future is dropped.
pub struct PeerTransport<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: PeerStream> PeerTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        self.write_all(&data).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        loop {
            match Handshake::decode(&self.read_buf) {
                Ok(handshake) => {
                    self.read_buf.advance(HANDSHAKE_LEN);
                    return Ok(handshake);
                }
                Err(e) if e.is_incomplete() => self.fill().await?,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.write_buf.clear();
        message.encode_into(&mut self.write_buf);
        let data = self.write_buf.split().freeze();
        self.write_all(&data).await
    }

    /// Reads the next message. Must only be called once the handshake is done;
    /// a second handshake on an established connection is a protocol violation.
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        loop {
            if Handshake::is_handshake(&self.read_buf) {
                return Err(PeerError::ProtocolViolation("second handshake".into()));
            }

            match Message::decode(&mut self.read_buf) {
                Ok(message) => return Ok(message),
                Err(e) if e.is_incomplete() => self.fill().await?,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn fill(&mut self) -> Result<(), PeerError> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
