//! Transport surface the engine consumes.
//!
//! A transport is a full-duplex endpoint exchanging complete self-delimited
//! frames (one encoded [`Message`](crate::Message) per frame). The public
//! API is the [`Transport`] enum; each backend lives in its own module
//! under `transport/`.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::TransportError;

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
#[cfg(feature = "websocket")]
pub mod websocket;

/// One transport endpoint.
#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "stream")]
    Stream(stream::StreamTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WebSocketTransport),
}

impl Transport {
    /// Send one complete frame.
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send_frame(frame).await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.send_frame(frame).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.send_frame(frame).await,
        }
    }

    /// Receive one complete frame. `Err(TransportError::Closed)` reports a
    /// clean shutdown; anything else is a fault.
    pub async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv_frame().await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.recv_frame().await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.recv_frame().await,
        }
    }

    /// Close the endpoint. Idempotent.
    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.close(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.is_closed(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.is_closed(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.local_addr(),
            _ => None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.peer_addr(),
            _ => None,
        }
    }

    /// In-process transport pair: frames sent on one end arrive on the
    /// other.
    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// Wrap any tokio byte duplex (TCP sockets included).
    #[cfg(feature = "stream")]
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(stream))
    }

    /// Wrap a TCP socket, capturing its addresses.
    #[cfg(feature = "stream")]
    pub fn tcp(stream: tokio::net::TcpStream) -> Self {
        Transport::Stream(stream::StreamTransport::from_tcp(stream))
    }

    /// Connected in-process byte-duplex pair.
    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }

    /// Wrap an established WebSocket; frames travel as binary messages.
    #[cfg(feature = "websocket")]
    pub fn websocket<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Transport::WebSocket(websocket::WebSocketTransport::new(ws))
    }
}
