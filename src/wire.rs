//! Wire: the transport-facing duplex owned by a session.
//!
//! A wire binds one [`Transport`] to an inbound and an outbound
//! [`MessageQueue`] and runs two pumps:
//!
//! 1. transport read → codec decode → `inbound.offer`, auto-read gated by
//!    the inbound queue's offerable state;
//! 2. `outbound.poll` → codec encode → transport write.
//!
//! Malformed frames fire `wire_error` and close the wire. Closing cascades
//! to both queues and the transport and fires `wire_closed` exactly once.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::{self, Decoded};
use crate::error::{CodecError, QueueClosed, TransportError, WireError};
use crate::message::Message;
use crate::queue::{DEFAULT_COOPERATIVE_LIMIT, MessageQueue, QueueListener};
use crate::transport::Transport;

/// Queue sizing for a wire. The cooperative limits are advisory depths,
/// not hard caps.
#[derive(Debug, Clone)]
pub struct WireOptions {
    pub inbound_limit: usize,
    pub outbound_limit: usize,
}

impl Default for WireOptions {
    fn default() -> Self {
        WireOptions {
            inbound_limit: DEFAULT_COOPERATIVE_LIMIT,
            outbound_limit: DEFAULT_COOPERATIVE_LIMIT,
        }
    }
}

/// Lifecycle callbacks for a wire.
pub trait WireListener: Send + Sync {
    fn wire_closed(&self, wire: &Wire);
    fn wire_error(&self, wire: &Wire, error: &WireError);
}

/// Authenticated peer identity, attached by a TLS-terminating transport
/// integration. The engine only carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub subject: String,
    pub certificate: Vec<u8>,
}

/// Narrow outbound capability handed to pipes: enqueue one message, nothing
/// else.
#[derive(Clone)]
pub struct Poster {
    outbound: Arc<MessageQueue<Message>>,
}

impl Poster {
    pub(crate) fn new(outbound: Arc<MessageQueue<Message>>) -> Poster {
        Poster { outbound }
    }

    pub fn post(&self, message: Message) -> Result<(), QueueClosed> {
        self.outbound.offer(message)
    }
}

#[derive(Clone)]
pub struct Wire {
    inner: Arc<WireInner>,
}

struct WireInner {
    transport: Transport,
    inbound: Arc<MessageQueue<Message>>,
    outbound: Arc<MessageQueue<Message>>,
    primary: bool,
    peer_identity: Option<PeerIdentity>,
    closed: AtomicBool,
    close_notify: Notify,
    listeners: Mutex<Vec<Arc<dyn WireListener>>>,
}

/// Auto-read switch driven by the inbound queue's offerable edge.
struct ReadGate {
    open: AtomicBool,
    notify: Notify,
}

struct GateListener {
    gate: Arc<ReadGate>,
}

impl QueueListener for GateListener {
    fn pollable_changed(&self, _pollable: bool) {}

    fn offerable_changed(&self, offerable: bool) {
        self.gate.open.store(offerable, Ordering::Release);
        if offerable {
            self.gate.notify.notify_waiters();
        }
    }
}

impl Wire {
    /// Bind a transport and start the pumps. `primary` is true on the side
    /// that accepted the connection.
    pub fn bind(transport: Transport, primary: bool, options: WireOptions) -> Wire {
        Self::bind_with_identity(transport, primary, None, options)
    }

    pub fn bind_with_identity(
        transport: Transport,
        primary: bool,
        peer_identity: Option<PeerIdentity>,
        options: WireOptions,
    ) -> Wire {
        let role = if primary { "primary" } else { "secondary" };
        let inbound = Arc::new(MessageQueue::new(
            format!("wire.{}.in", role),
            options.inbound_limit,
        ));
        let outbound = Arc::new(MessageQueue::new(
            format!("wire.{}.out", role),
            options.outbound_limit,
        ));

        let wire = Wire {
            inner: Arc::new(WireInner {
                transport,
                inbound,
                outbound,
                primary,
                peer_identity,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        };

        let gate = Arc::new(ReadGate {
            open: AtomicBool::new(true),
            notify: Notify::new(),
        });
        wire.inner
            .inbound
            .add_listener(Arc::new(GateListener { gate: gate.clone() }));

        tokio::spawn(read_pump(wire.clone(), gate));
        tokio::spawn(write_pump(wire.clone()));
        wire
    }

    /// Messages decoded off the transport, in arrival order.
    pub fn inbound(&self) -> &Arc<MessageQueue<Message>> {
        &self.inner.inbound
    }

    /// Messages awaiting encode and transmission.
    pub fn outbound(&self) -> &Arc<MessageQueue<Message>> {
        &self.inner.outbound
    }

    /// The narrow send-only capability over this wire's outbound queue.
    pub fn poster(&self) -> Poster {
        Poster {
            outbound: self.inner.outbound.clone(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.transport.peer_addr()
    }

    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.inner.peer_identity.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Arc<dyn WireListener>) {
        self.inner.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn WireListener>) {
        self.inner
            .listeners
            .lock()
            .retain(|other| !Arc::ptr_eq(other, listener));
    }

    /// Close the wire: both queues, the transport, then `wire_closed`.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(primary = self.inner.primary, "wire closed");
        self.inner.inbound.close();
        self.inner.outbound.close();
        self.inner.transport.close();
        self.inner.close_notify.notify_waiters();

        let listeners: Vec<Arc<dyn WireListener>> = self.inner.listeners.lock().clone();
        for listener in &listeners {
            listener.wire_closed(self);
        }
    }

    fn fire_error(&self, error: &WireError) {
        tracing::warn!(%error, "wire error");
        let listeners: Vec<Arc<dyn WireListener>> = self.inner.listeners.lock().clone();
        for listener in &listeners {
            listener.wire_error(self, error);
        }
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("primary", &self.inner.primary)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_pump(wire: Wire, gate: Arc<ReadGate>) {
    let inner = &wire.inner;
    loop {
        // Auto-read: suspend while the inbound queue is saturated.
        while !gate.open.load(Ordering::Acquire) && !wire.is_closed() {
            let mut opened = pin!(gate.notify.notified());
            opened.as_mut().enable();
            let mut closed = pin!(inner.close_notify.notified());
            closed.as_mut().enable();
            if gate.open.load(Ordering::Acquire) || wire.is_closed() {
                break;
            }
            tokio::select! {
                _ = opened => {}
                _ = closed => {}
            }
        }
        if wire.is_closed() {
            break;
        }

        let mut closed = pin!(inner.close_notify.notified());
        closed.as_mut().enable();
        if wire.is_closed() {
            break;
        }
        let frame = tokio::select! {
            _ = closed => break,
            frame = inner.transport.recv_frame() => frame,
        };

        match frame {
            Ok(frame) => match codec::decode(&frame) {
                Ok(Decoded::Frame { message, consumed }) if consumed == frame.len() => {
                    tracing::trace!(pipe_id = message.pipe_id(), "frame in");
                    if inner.inbound.offer(message).is_err() {
                        break;
                    }
                }
                Ok(_) => {
                    wire.fire_error(&WireError::Codec(CodecError::Malformed(
                        "transport frame length does not match its header".into(),
                    )));
                    break;
                }
                Err(err) => {
                    wire.fire_error(&WireError::Codec(err));
                    break;
                }
            },
            Err(TransportError::Closed) => break,
            Err(err) => {
                wire.fire_error(&WireError::Transport(err));
                break;
            }
        }
    }
    wire.close();
}

async fn write_pump(wire: Wire) {
    let inner = &wire.inner;
    loop {
        let Some(message) = inner.outbound.poll(None).await else {
            break;
        };
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(err) => {
                wire.fire_error(&WireError::Codec(err));
                break;
            }
        };

        let mut closed = pin!(inner.close_notify.notified());
        closed.as_mut().enable();
        if wire.is_closed() {
            break;
        }
        let sent = tokio::select! {
            _ = closed => Err(TransportError::Closed),
            sent = inner.transport.send_frame(frame) => sent,
        };
        match sent {
            Ok(()) => tracing::trace!(pipe_id = message.pipe_id(), "frame out"),
            Err(TransportError::Closed) => break,
            Err(err) => {
                wire.fire_error(&WireError::Transport(err));
                break;
            }
        }
    }
    wire.close();
}
