//! Session: the logical RPC association over one wire.
//!
//! A session owns one [`Wire`] and one [`PipeSpace`]. Right after binding,
//! both peers exchange `SyncSession`; the first inbound message of a
//! session MUST be one, anything else is a protocol violation that closes
//! the wire. Once running, a dispatcher loop routes every inbound message
//! to its pipe, spawning a service invocation for each `Open`.
//!
//! Graceful close runs in a fixed order: abort every live pipe, emit
//! `Control(SessionClose)`, close the outbound queue and let the write
//! pump drain it, then the wire goes down.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::error::{HandshakeError, ProtocolError, SessionError};
use crate::message::{
    Abort, Block, Close, Control, Message, Open, PROTOCOL_VERSION, SyncSession,
};
use crate::pipe::{DEFAULT_BLOCK_QUEUE_LIMIT, PipeHandle};
use crate::service::{CallContext, Service};
use crate::space::PipeSpace;
use crate::wire::{Wire, WireListener};

pub(crate) type ServiceMap = Arc<RwLock<HashMap<String, Arc<dyn Service>>>>;
pub(crate) type CloseHook = Box<dyn FnOnce(u64) + Send>;

/// Session construction parameters.
#[derive(Clone)]
pub struct SessionOptions {
    /// Protocol version advertised in SyncSession. Peers with a different
    /// major (high 16 bits) are rejected.
    pub version: u32,
    /// Free-form key/value pairs advertised in SyncSession.
    pub config: BTreeMap<String, String>,
    /// Cooperative limit for each stream-enabled pipe's block queue.
    pub block_queue_limit: usize,
    /// How long to wait for the peer's SyncSession.
    pub handshake_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            version: PROTOCOL_VERSION,
            config: BTreeMap::new(),
            block_queue_limit: DEFAULT_BLOCK_QUEUE_LIMIT,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    wire: Wire,
    space: PipeSpace,
    services: ServiceMap,
    block_queue_limit: usize,
    remote_sync: SyncSession,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseHook>>,
}

impl Session {
    /// Exchange SyncSession over a freshly bound wire and start the
    /// dispatcher loop.
    pub(crate) async fn handshake(
        wire: Wire,
        services: ServiceMap,
        options: SessionOptions,
        on_close: Option<CloseHook>,
    ) -> Result<Session, SessionError> {
        let primary = wire.is_primary();
        let local_id: u64 = rand::random();

        let mut config = options.config.clone();
        if primary {
            config.insert(
                SyncSession::SESSION_ID_KEY.to_string(),
                format!("{:x}", local_id),
            );
        }
        let sync = SyncSession::new(options.version, now_millis(), config);
        wire.outbound()
            .offer(Message::Control(Control::SyncSession(sync)))
            .map_err(|_| SessionError::Handshake(HandshakeError::WireClosed))?;

        let remote_sync = match wire.inbound().poll(Some(options.handshake_timeout)).await {
            Some(Message::Control(Control::SyncSession(sync))) => sync,
            Some(other) => {
                tracing::warn!(pipe_id = other.pipe_id(), "handshake violation");
                wire.close();
                return Err(HandshakeError::Protocol(ProtocolError::HandshakeExpected).into());
            }
            None => {
                wire.close();
                return Err(HandshakeError::WireClosed.into());
            }
        };

        if remote_sync.version >> 16 != options.version >> 16 {
            wire.close();
            return Err(HandshakeError::VersionMismatch {
                local: options.version,
                remote: remote_sync.version,
            }
            .into());
        }

        // The accepting peer assigns the session id; the initiator adopts
        // the advertised one.
        let id = if primary {
            local_id
        } else {
            remote_sync.session_id().unwrap_or(local_id)
        };

        tracing::debug!(
            session_id = id,
            primary,
            remote_version = remote_sync.version,
            "session running"
        );

        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                wire,
                space: PipeSpace::new(primary),
                services,
                block_queue_limit: options.block_queue_limit,
                remote_sync,
                closed: AtomicBool::new(false),
                on_close: Mutex::new(on_close),
            }),
        };
        tokio::spawn(dispatch_loop(session.clone()));
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this side accepted the transport.
    pub fn is_primary(&self) -> bool {
        self.inner.wire.is_primary()
    }

    pub fn wire(&self) -> &Wire {
        &self.inner.wire
    }

    /// Configuration the peer advertised during the handshake.
    pub fn remote_config(&self) -> &BTreeMap<String, String> {
        &self.inner.remote_sync.config
    }

    pub fn remote_version(&self) -> u32 {
        self.inner.remote_sync.version
    }

    /// Peer's wall clock at handshake time, for diagnostics.
    pub fn remote_utc_time(&self) -> i64 {
        self.inner.remote_sync.utc_time
    }

    /// Live pipes on this session.
    pub fn pipe_count(&self) -> usize {
        self.inner.space.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Initiate a call. The returned handle resolves exactly once with the
    /// remote result, a remote abort, or a local abort on transport loss.
    pub fn open(
        &self,
        priority: i8,
        service_id: &str,
        function_id: u16,
        params: Bytes,
        stream_enabled: bool,
    ) -> Result<PipeHandle, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let (pipe, outcome) = self.inner.space.create_local(
            priority,
            service_id,
            function_id,
            stream_enabled,
            self.inner.block_queue_limit,
            self.inner.wire.poster(),
        )?;
        if let Err(err) = pipe.emit_open(params) {
            pipe.transport_lost();
            return Err(err);
        }
        tracing::trace!(
            session_id = self.inner.id,
            pipe_id = pipe.id(),
            service_id,
            function_id,
            "pipe opened"
        );
        Ok(PipeHandle::new(pipe, outcome))
    }

    /// Close the session and wait for the wire to go down. With `graceful`
    /// every live pipe is aborted with SessionClosing and the peer receives
    /// `Control(SessionClose)` after those per-pipe closes; without it the
    /// wire is torn down immediately.
    pub async fn close(&self, graceful: bool) {
        self.shutdown(graceful);
        wait_for_wire_close(&self.inner.wire).await;
    }

    fn shutdown(&self, graceful: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session_id = self.inner.id, graceful, "session closing");
        if graceful {
            self.inner.space.close(true);
            let _ = self
                .inner
                .wire
                .outbound()
                .offer(Message::Control(Control::SessionClose));
            // The write pump drains what is queued, then closes the wire.
            self.inner.wire.outbound().close();
        } else {
            self.inner.space.close(false);
            self.inner.wire.close();
        }
        if let Some(hook) = self.inner.on_close.lock().take() {
            hook(self.inner.id);
        }
    }

    fn handle_open(&self, open: Open) {
        let poster = self.inner.wire.poster();
        if self.inner.space.is_closed() {
            let _ = poster.post(Message::Close(Close::with_abort(
                open.pipe_id,
                &Abort::session_closing(),
            )));
            return;
        }

        let service = self.inner.services.read().get(&open.service_id).cloned();
        let stream_enabled = service
            .as_ref()
            .map(|service| service.accepts_blocks(open.function_id))
            .unwrap_or(false);

        let pipe = match self.inner.space.create_from_open(
            &open,
            stream_enabled,
            self.inner.block_queue_limit,
            poster.clone(),
        ) {
            Ok(pipe) => pipe,
            Err(err) => {
                // Per-pipe violation: answer with an abort, session stays up.
                tracing::warn!(pipe_id = open.pipe_id, %err, "rejecting open");
                let _ = poster.post(Message::Close(Close::with_abort(
                    open.pipe_id,
                    &Abort::unexpected(err.to_string()),
                )));
                return;
            }
        };

        let Some(service) = service else {
            pipe.close_with_abort(Abort::service_undefined(&open.service_id));
            return;
        };

        let call = CallContext::new(self.inner.id, pipe.clone(), open.params);
        let invocation = service.invoke(call);
        tokio::spawn(async move {
            match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(Ok(result)) => pipe.close_with_result(result),
                Ok(Err(abort)) => pipe.close_with_abort(abort),
                Err(_) => pipe.close_with_abort(Abort::unexpected("internal error")),
            }
        });
    }

    fn handle_close(&self, close: Close) {
        match self.inner.space.get(close.pipe_id) {
            Some(pipe) => pipe.remote_close(close),
            // Close races against local termination are normal.
            None => tracing::trace!(pipe_id = close.pipe_id, "close for unknown pipe"),
        }
    }

    fn handle_block(&self, block: Block) {
        match self.inner.space.get(block.pipe_id) {
            Some(pipe) => pipe.remote_block(block),
            // Blocks racing a terminal close are normal; only a block for a
            // pipe that never lived here is answered with an abort.
            None if self.inner.space.was_recently_closed(block.pipe_id) => {
                tracing::trace!(pipe_id = block.pipe_id, "block for closed pipe dropped");
            }
            None => {
                let _ = self.inner.wire.poster().post(Message::Close(Close::with_abort(
                    block.pipe_id,
                    &Abort::destination_unreachable(block.pipe_id),
                )));
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("primary", &self.is_primary())
            .field("pipes", &self.pipe_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn dispatch_loop(session: Session) {
    loop {
        let Some(message) = session.inner.wire.inbound().poll(None).await else {
            break;
        };
        match message {
            Message::Open(open) => session.handle_open(open),
            Message::Close(close) => session.handle_close(close),
            Message::Block(block) => session.handle_block(block),
            Message::Control(Control::SessionClose) => {
                tracing::debug!(session_id = session.inner.id, "peer closed the session");
                session.shutdown(false);
            }
            Message::Control(Control::SyncSession(_)) => {
                tracing::warn!(
                    session_id = session.inner.id,
                    "{}",
                    ProtocolError::UnexpectedSyncSession
                );
                session.shutdown(false);
            }
        }
    }
    // Wire gone: fail whatever is still outstanding, emitting nothing.
    session.shutdown(false);
}

struct ClosedWaiter {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl WireListener for ClosedWaiter {
    fn wire_closed(&self, _wire: &Wire) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
    }

    fn wire_error(&self, _wire: &Wire, _error: &crate::error::WireError) {}
}

async fn wait_for_wire_close(wire: &Wire) {
    let (tx, rx) = oneshot::channel();
    let waiter = Arc::new(ClosedWaiter {
        tx: Mutex::new(Some(tx)),
    });
    let listener: Arc<dyn WireListener> = waiter;
    wire.add_listener(listener.clone());
    if !wire.is_closed() {
        let _ = rx.await;
    }
    wire.remove_listener(&listener);
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::transport::Transport;
    use crate::wire::WireOptions;

    fn empty_services() -> ServiceMap {
        Arc::new(RwLock::new(HashMap::new()))
    }

    async fn session_pair() -> (Session, Session) {
        let (ta, tb) = Transport::mem_pair();
        let a = Wire::bind(ta, true, WireOptions::default());
        let b = Wire::bind(tb, false, WireOptions::default());
        let (a, b) = tokio::join!(
            Session::handshake(a, empty_services(), SessionOptions::default(), None),
            Session::handshake(b, empty_services(), SessionOptions::default(), None),
        );
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn handshake_agrees_on_the_primary_assigned_id() {
        let (a, b) = session_pair().await;
        assert!(a.is_primary());
        assert!(!b.is_primary());
        assert_eq!(a.id(), b.id());
        assert_eq!(b.remote_config().get("session.id").unwrap(), &format!("{:x}", a.id()));
    }

    #[tokio::test]
    async fn handshake_rejects_a_non_sync_first_message() {
        let (ta, tb) = Transport::mem_pair();
        let wire = Wire::bind(ta, true, WireOptions::default());

        let rogue = codec::encode(&Message::Open(Open {
            pipe_id: 1,
            priority: 0,
            service_id: "echo".to_string(),
            function_id: 1,
            params: Bytes::new(),
        }))
        .unwrap();
        tb.send_frame(rogue).await.unwrap();

        let err = Session::handshake(
            wire.clone(),
            empty_services(),
            SessionOptions::default(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::Protocol(ProtocolError::HandshakeExpected))
        ));
        assert!(wire.is_closed());
    }

    #[tokio::test]
    async fn handshake_rejects_an_incompatible_major_version() {
        let (ta, tb) = Transport::mem_pair();
        let a = Wire::bind(ta, true, WireOptions::default());
        let b = Wire::bind(tb, false, WireOptions::default());

        let old = SessionOptions {
            version: 0x0000_0003,
            ..SessionOptions::default()
        };
        let (a, _b) = tokio::join!(
            Session::handshake(a, empty_services(), SessionOptions::default(), None),
            Session::handshake(b, empty_services(), old, None),
        );
        assert!(matches!(
            a.unwrap_err(),
            SessionError::Handshake(HandshakeError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn open_after_close_fails_fast() {
        let (a, _b) = session_pair().await;
        a.close(true).await;
        assert!(a.is_closed());
        assert!(matches!(
            a.open(0, "echo", 1, Bytes::new(), false),
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn peer_observes_session_close_control() {
        let (a, b) = session_pair().await;
        a.close(true).await;

        // The peer's dispatcher receives Control('C') and shuts down.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !b.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer never observed the session close");
    }
}
