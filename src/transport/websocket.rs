//! WebSocket transport: one protocol frame per binary message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::error::TransportError;

type BoxedSink = Box<dyn Sink<WsMessage, Error = WsError> + Unpin + Send>;
type BoxedStream = Box<dyn Stream<Item = Result<WsMessage, WsError>> + Unpin + Send>;

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    sink: AsyncMutex<BoxedSink>,
    stream: AsyncMutex<BoxedStream>,
    closed: AtomicBool,
}

impl WebSocketTransport {
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream): (SplitSink<_, _>, SplitStream<_>) = ws.split();
        WebSocketTransport {
            inner: Arc::new(WsInner {
                sink: AsyncMutex::new(Box::new(sink)),
                stream: AsyncMutex::new(Box::new(stream)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(WsMessage::binary(frame.to_vec()))
            .await
            .map_err(ws_error)
    }

    pub async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut stream = self.inner.stream.lock().await;
        loop {
            match stream.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(ws_error(err)),
                Some(Ok(WsMessage::Binary(data))) => {
                    return Ok(Bytes::copy_from_slice(data.as_ref()));
                }
                Some(Ok(WsMessage::Close(_))) => return Err(TransportError::Closed),
                // Text and ping/pong traffic is not part of the protocol.
                Some(Ok(_)) => continue,
            }
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn ws_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Io(std::io::Error::other(other)),
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (client, server) = tokio::io::duplex(65536);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    async fn transport_pair() -> (WebSocketTransport, WebSocketTransport) {
        let (client, server) = ws_pair().await;
        (
            WebSocketTransport::new(client),
            WebSocketTransport::new(server),
        )
    }

    #[tokio::test]
    async fn frames_cross_the_pair() {
        let (a, b) = transport_pair().await;
        a.send_frame(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), Bytes::from_static(b"ping"));

        b.send_frame(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.recv_frame().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn back_to_back_frames_are_delimited() {
        let (a, b) = transport_pair().await;
        a.send_frame(Bytes::from_static(b"one")).await.unwrap();
        a.send_frame(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv_frame().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn non_binary_messages_are_skipped() {
        let (mut client, server) = ws_pair().await;
        let server = WebSocketTransport::new(server);

        client.send(WsMessage::text("ignored")).await.unwrap();
        client
            .send(WsMessage::binary(b"frame".to_vec()))
            .await
            .unwrap();

        assert_eq!(
            server.recv_frame().await.unwrap(),
            Bytes::from_static(b"frame")
        );
    }

    #[tokio::test]
    async fn close_message_reports_closed() {
        let (mut client, server) = ws_pair().await;
        let server = WebSocketTransport::new(server);

        client.send(WsMessage::Close(None)).await.unwrap();
        assert!(matches!(
            server.recv_frame().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn closed_flag_fails_operations() {
        let (a, _b) = transport_pair().await;
        a.close();
        assert!(a.is_closed());
        assert!(matches!(
            a.send_frame(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.recv_frame().await, Err(TransportError::Closed)));
    }
}
