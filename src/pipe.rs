//! Per-call pipe state machine.
//!
//! A pipe is born by an `Open`, optionally streams `Block`s in flight, and
//! dies with exactly one terminal outcome: a remote result, a remote abort,
//! or a local abort. Local close, remote close, and transport loss race
//! through a single CAS guard, so concurrent terminations produce exactly
//! one observable outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::SessionError;
use crate::message::{Abort, Block, Close, MAX_PAYLOAD_SIZE, Message, Open};
use crate::queue::MessageQueue;
use crate::space::SpaceInner;
use crate::wire::Poster;

/// Default internal buffer of a [`BlockSink`].
pub const DEFAULT_SINK_BUFFER: usize = 4096;

/// Default cooperative limit of a stream-enabled pipe's block queue.
pub const DEFAULT_BLOCK_QUEUE_LIMIT: usize = 64;

/// Terminal result of a pipe: the remote result or an abort.
pub type Outcome = Result<Bytes, Abort>;

/// One scoped call over a session. Owned by the session's pipe space;
/// clones share the same state.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

struct PipeInner {
    id: u16,
    priority: i8,
    service_id: String,
    function_id: u16,
    stream_enabled: bool,
    closed: AtomicBool,
    outcome: Mutex<Option<oneshot::Sender<Outcome>>>,
    /// Inbound block queue; present only on stream-enabled pipes.
    blocks: Option<Arc<MessageQueue<Block>>>,
    poster: Poster,
    space: Weak<SpaceInner>,
}

impl Pipe {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u16,
        priority: i8,
        service_id: String,
        function_id: u16,
        stream_enabled: bool,
        block_queue_limit: usize,
        poster: Poster,
        space: Weak<SpaceInner>,
    ) -> (Pipe, oneshot::Receiver<Outcome>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let blocks = stream_enabled.then(|| {
            Arc::new(MessageQueue::new(
                format!("pipe[{:#06x}].blocks", id),
                block_queue_limit,
            ))
        });
        let pipe = Pipe {
            inner: Arc::new(PipeInner {
                id,
                priority,
                service_id,
                function_id,
                stream_enabled,
                closed: AtomicBool::new(false),
                outcome: Mutex::new(Some(outcome_tx)),
                blocks,
                poster,
                space,
            }),
        };
        (pipe, outcome_rx)
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn priority(&self) -> i8 {
        self.inner.priority
    }

    pub fn service_id(&self) -> &str {
        &self.inner.service_id
    }

    pub fn function_id(&self) -> u16 {
        self.inner.function_id
    }

    pub fn stream_enabled(&self) -> bool {
        self.inner.stream_enabled
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The inbound block stream of a stream-enabled pipe.
    pub fn block_source(&self) -> Option<BlockSource> {
        self.inner.blocks.clone().map(|queue| BlockSource { queue })
    }

    /// An auto-flushing outbound byte sink over this pipe.
    pub fn block_sink(&self) -> BlockSink {
        self.block_sink_with_buffer(DEFAULT_SINK_BUFFER)
    }

    pub fn block_sink_with_buffer(&self, capacity: usize) -> BlockSink {
        BlockSink {
            pipe: self.clone(),
            buf: BytesMut::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            finished: false,
        }
    }

    /// Emit this pipe's Open on the session outbound.
    pub(crate) fn emit_open(&self, params: Bytes) -> Result<(), SessionError> {
        self.inner
            .poster
            .post(Message::Open(Open {
                pipe_id: self.inner.id,
                priority: self.inner.priority,
                service_id: self.inner.service_id.clone(),
                function_id: self.inner.function_id,
                params,
            }))
            .map_err(|_| SessionError::Closed)
    }

    fn post_block(&self, payload: Bytes, eof: bool) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let block = if eof {
            debug_assert!(payload.is_empty());
            Block::eof(self.inner.id)
        } else {
            Block::new(self.inner.id, payload)
        };
        self.inner
            .poster
            .post(Message::Block(block))
            .map_err(|_| SessionError::Closed)
    }

    /// First close wins; later attempts are no-ops.
    fn begin_close(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    fn resolve(&self, outcome: Outcome) {
        if let Some(sender) = self.inner.outcome.lock().take() {
            // The awaiter may be gone; the close already happened either way.
            let _ = sender.send(outcome);
        }
        if let Some(blocks) = &self.inner.blocks {
            blocks.close();
        }
        if let Some(space) = self.inner.space.upgrade() {
            space.remove(self.inner.id);
        }
    }

    /// Terminate locally with a successful result; emits `Close` to the
    /// peer.
    pub fn close_with_result(&self, result: Bytes) {
        if !self.begin_close() {
            return;
        }
        tracing::trace!(pipe_id = self.inner.id, "pipe closed (success)");
        let _ = self
            .inner
            .poster
            .post(Message::Close(Close::with_result(self.inner.id, result.clone())));
        self.resolve(Ok(result));
    }

    /// Terminate locally with an abort; emits `Close` to the peer.
    pub fn close_with_abort(&self, abort: Abort) {
        if !self.begin_close() {
            return;
        }
        tracing::trace!(pipe_id = self.inner.id, code = abort.code, "pipe closed (abort)");
        let _ = self
            .inner
            .poster
            .post(Message::Close(Close::with_abort(self.inner.id, &abort)));
        self.resolve(Err(abort));
    }

    /// Terminal `Close` arrived from the peer; nothing is emitted back.
    pub(crate) fn remote_close(&self, close: Close) {
        if !self.begin_close() {
            return;
        }
        tracing::trace!(pipe_id = self.inner.id, code = close.code, "pipe closed by peer");
        match close.abort() {
            None => self.resolve(Ok(close.result)),
            Some(abort) => self.resolve(Err(abort)),
        }
    }

    /// A `Block` arrived from the peer.
    pub(crate) fn remote_block(&self, block: Block) {
        if !self.inner.stream_enabled {
            self.close_with_abort(Abort::function_cannot_receive_block(self.inner.id));
            return;
        }
        let eof = block.eof;
        if let Some(blocks) = &self.inner.blocks {
            let _ = blocks.offer(block);
            if eof {
                blocks.close();
            }
        }
    }

    /// The wire is gone: fail the outcome without emitting anything.
    pub(crate) fn transport_lost(&self) {
        if !self.begin_close() {
            return;
        }
        tracing::trace!(pipe_id = self.inner.id, "pipe closed (transport lost)");
        self.resolve(Err(Abort::unexpected("transport lost")));
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("service_id", &self.inner.service_id)
            .field("function_id", &self.inner.function_id)
            .field("stream_enabled", &self.inner.stream_enabled)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Caller-side handle for a locally opened pipe.
pub struct PipeHandle {
    pipe: Pipe,
    outcome: oneshot::Receiver<Outcome>,
    source: Option<BlockSource>,
}

impl PipeHandle {
    pub(crate) fn new(pipe: Pipe, outcome: oneshot::Receiver<Outcome>) -> PipeHandle {
        let source = pipe.block_source();
        PipeHandle {
            pipe,
            outcome,
            source,
        }
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    pub fn pipe_id(&self) -> u16 {
        self.pipe.id()
    }

    /// Outbound byte sink for streaming blocks to the callee.
    pub fn sink(&self) -> BlockSink {
        self.pipe.block_sink()
    }

    /// Inbound block stream, for stream-enabled calls. Take-once.
    pub fn source(&mut self) -> Option<BlockSource> {
        self.source.take()
    }

    /// Abort the call locally.
    pub fn abort(&self, abort: Abort) {
        self.pipe.close_with_abort(abort);
    }

    /// Wait for the call's single terminal outcome.
    pub async fn outcome(self) -> Outcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Abort::unexpected("pipe dropped without outcome")),
        }
    }
}

impl std::fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeHandle")
            .field("pipe", &self.pipe)
            .finish()
    }
}

/// Auto-flushing outbound byte sink.
///
/// Small writes are buffered and flushed as one block when the buffer
/// fills; writes at or above [`MAX_PAYLOAD_SIZE`] are split into maximal
/// blocks. `close` emits the final EOF block. One producer per pipe.
pub struct BlockSink {
    pipe: Pipe,
    buf: BytesMut,
    capacity: usize,
    finished: bool,
}

impl BlockSink {
    pub fn write(&mut self, mut data: &[u8]) -> Result<(), SessionError> {
        if self.finished || self.pipe.is_closed() {
            return Err(SessionError::Closed);
        }
        if !self.buf.is_empty() {
            let room = self.capacity - self.buf.len();
            if data.len() < room {
                self.buf.put_slice(data);
                return Ok(());
            }
            self.buf.put_slice(&data[..room]);
            data = &data[room..];
            self.flush()?;
        }
        while data.len() >= MAX_PAYLOAD_SIZE {
            self.pipe
                .post_block(Bytes::copy_from_slice(&data[..MAX_PAYLOAD_SIZE]), false)?;
            data = &data[MAX_PAYLOAD_SIZE..];
        }
        if data.len() >= self.capacity {
            self.pipe.post_block(Bytes::copy_from_slice(data), false)?;
        } else if !data.is_empty() {
            self.buf.put_slice(data);
        }
        Ok(())
    }

    /// Force out whatever is buffered.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let payload = self.buf.split().freeze();
        self.pipe.post_block(payload, false)
    }

    /// Flush and emit the EOF block; further writes fail.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.finished {
            return Ok(());
        }
        self.flush()?;
        self.finished = true;
        self.pipe.post_block(Bytes::new(), true)
    }
}

/// Inbound block stream of a stream-enabled pipe, terminated by EOF.
pub struct BlockSource {
    queue: Arc<MessageQueue<Block>>,
}

impl BlockSource {
    /// Next non-empty payload, or `None` once the stream ends.
    pub async fn read(&self) -> Option<Bytes> {
        loop {
            let block = self.queue.poll(None).await?;
            if !block.payload.is_empty() {
                return Some(block.payload);
            }
        }
    }

    /// Reassemble the whole stream.
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(payload) = self.read().await {
            out.extend_from_slice(&payload);
        }
        out
    }
}
