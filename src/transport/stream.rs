//! Byte-stream transport over any tokio `AsyncRead + AsyncWrite` duplex.
//!
//! Frames are delimited by the codec's own header: a one-byte tag and a
//! little-endian `u16` total length. The reader returns whole frames,
//! header included, and distinguishes a clean EOF (before any header byte)
//! from a truncated frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::FRAME_HEADER_LEN;
use crate::error::TransportError;

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Wrap a TCP socket, capturing its addresses.
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = tokio::io::split(stream);
        StreamTransport {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                local_addr,
                peer_addr,
            }),
        }
    }

    /// Build from separate read and write halves, such as a split TCP
    /// connection or stdin/stdout.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        StreamTransport {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                local_addr: None,
                peer_addr: None,
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.inner.reader.lock().await;

        let mut header = [0u8; FRAME_HEADER_LEN];
        match reader.read_exact(&mut header[..1]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Stream ended between frames: clean close.
                return Err(TransportError::Closed);
            }
            Err(e) => return Err(e.into()),
        }
        reader
            .read_exact(&mut header[1..])
            .await
            .map_err(truncated)?;

        let total = u16::from_le_bytes([header[1], header[2]]) as usize;
        if total < FRAME_HEADER_LEN {
            return Err(TransportError::Malformed(format!(
                "frame length {} below header size",
                total
            )));
        }

        let mut frame = vec![0u8; total];
        frame[..FRAME_HEADER_LEN].copy_from_slice(&header);
        reader
            .read_exact(&mut frame[FRAME_HEADER_LEN..])
            .await
            .map_err(truncated)?;
        Ok(Bytes::from(frame))
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn truncated(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Malformed("stream ended inside a frame".to_string())
    } else {
        TransportError::Io(err)
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::message::{Control, Message};

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (a, b) = StreamTransport::pair();
        let frame = codec::encode(&Message::Control(Control::SessionClose)).unwrap();
        a.send_frame(frame.clone()).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn back_to_back_frames_are_delimited() {
        let (a, b) = StreamTransport::pair();
        let frame = codec::encode(&Message::Control(Control::SessionClose)).unwrap();
        a.send_frame(frame.clone()).await.unwrap();
        a.send_frame(frame.clone()).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), frame);
        assert_eq!(b.recv_frame().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn clean_eof_reports_closed() {
        let (a, b) = StreamTransport::pair();
        drop(a);
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_malformed() {
        let (mut client, server) = tokio::io::duplex(64);
        // A header announcing 10 bytes, then EOF.
        client.write_all(&[b'(', 10, 0, 1, 2]).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let transport = StreamTransport::new(server);
        assert!(matches!(
            transport.recv_frame().await,
            Err(TransportError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn closed_flag_fails_operations() {
        let (a, _b) = StreamTransport::pair();
        a.close();
        assert!(matches!(
            a.send_frame(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.recv_frame().await, Err(TransportError::Closed)));
    }
}
