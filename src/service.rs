//! Service surface invoked for incoming calls.

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::message::Abort;
use crate::pipe::{BlockSink, BlockSource, Pipe};

/// Handler for one service id.
///
/// `invoke` runs once per incoming `Open`; its resolution becomes the
/// pipe's terminal `Close`. Handlers receive an explicit [`CallContext`]
/// rather than any ambient state, and stream blocks through it when the
/// function accepts them.
pub trait Service: Send + Sync + 'static {
    fn invoke(&self, call: CallContext) -> BoxFuture<'static, Result<Bytes, Abort>>;

    /// Whether `function_id` consumes an inbound block stream. Functions
    /// that answer `false` here abort with FunctionCannotReceiveBlock when
    /// a block arrives.
    fn accepts_blocks(&self, function_id: u16) -> bool {
        let _ = function_id;
        false
    }
}

/// Everything a handler may touch for one call.
pub struct CallContext {
    session_id: u64,
    pipe: Pipe,
    params: Bytes,
    source: Option<BlockSource>,
}

impl CallContext {
    pub(crate) fn new(session_id: u64, pipe: Pipe, params: Bytes) -> CallContext {
        let source = pipe.block_source();
        CallContext {
            session_id,
            pipe,
            params,
            source,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn service_id(&self) -> &str {
        self.pipe.service_id()
    }

    pub fn function_id(&self) -> u16 {
        self.pipe.function_id()
    }

    pub fn priority(&self) -> i8 {
        self.pipe.priority()
    }

    /// Encoded argument list from the `Open`.
    pub fn params(&self) -> &Bytes {
        &self.params
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    /// The call's inbound block stream, when the function accepts one.
    /// Take-once.
    pub fn blocks(&mut self) -> Option<BlockSource> {
        self.source.take()
    }

    /// Outbound block sink toward the caller.
    pub fn sink(&self) -> BlockSink {
        self.pipe.block_sink()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("session_id", &self.session_id)
            .field("pipe", &self.pipe)
            .field("params_len", &self.params.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::DEFAULT_BLOCK_QUEUE_LIMIT;
    use crate::queue::MessageQueue;
    use crate::wire::Poster;
    use std::sync::{Arc, Weak};

    struct Echo;

    impl Service for Echo {
        fn invoke(&self, call: CallContext) -> BoxFuture<'static, Result<Bytes, Abort>> {
            Box::pin(async move {
                match call.function_id() {
                    1 => Ok(call.params().clone()),
                    other => Err(Abort::function_undefined(other)),
                }
            })
        }
    }

    fn call(function_id: u16) -> CallContext {
        let outbound = Arc::new(MessageQueue::new("test.out", 16));
        let (pipe, _outcome) = Pipe::new(
            1,
            0,
            "echo".to_string(),
            function_id,
            false,
            DEFAULT_BLOCK_QUEUE_LIMIT,
            Poster::new(outbound),
            Weak::new(),
        );
        CallContext::new(9, pipe, Bytes::from_static(b"hello"))
    }

    #[tokio::test]
    async fn invoke_resolves_with_params() {
        let result = Echo.invoke(call(1)).await;
        assert_eq!(result.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn unknown_function_aborts() {
        let abort = Echo.invoke(call(9)).await.unwrap_err();
        assert_eq!(abort.code, crate::message::abort_code::FUNCTION_UNDEFINED);
    }

    #[test]
    fn non_stream_service_rejects_blocks_by_default() {
        assert!(!Echo.accepts_blocks(1));
    }
}
