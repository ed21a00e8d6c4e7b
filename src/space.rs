//! Per-session pipe registry and id allocation.
//!
//! The two peers split the 16-bit pipe-id space by the high bit, so ids
//! never need cross-peer coordination: the primary (transport-accepting)
//! side issues ids with bit 15 set, the secondary with it clear. Each side
//! can hold up to 2^15 concurrent pipes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ProtocolError, SessionError};
use crate::message::{Abort, CONTROL_PIPE_ID, Open, PRIMARY_PIPE_MASK};
use crate::pipe::{Outcome, Pipe};
use crate::wire::Poster;

#[derive(Clone)]
pub struct PipeSpace {
    inner: Arc<SpaceInner>,
}

/// How many terminated pipe ids are remembered to tell a late straggler
/// from a message for a pipe that never existed.
const RECENTLY_CLOSED_CAPACITY: usize = 128;

pub(crate) struct SpaceInner {
    primary: bool,
    sequence: AtomicU16,
    pipes: Mutex<HashMap<u16, Pipe>>,
    /// Ids of recently terminated pipes, oldest first.
    recently_closed: Mutex<VecDeque<u16>>,
    closed: AtomicBool,
}

impl SpaceInner {
    pub(crate) fn remove(&self, id: u16) {
        self.pipes.lock().remove(&id);
        let mut recent = self.recently_closed.lock();
        if !recent.contains(&id) {
            if recent.len() == RECENTLY_CLOSED_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(id);
        }
    }
}

impl PipeSpace {
    /// `primary` is this side's transport role.
    pub fn new(primary: bool) -> PipeSpace {
        PipeSpace {
            inner: Arc::new(SpaceInner {
                primary,
                sequence: AtomicU16::new(0),
                pipes: Mutex::new(HashMap::new()),
                recently_closed: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn get(&self, id: u16) -> Option<Pipe> {
        self.inner.pipes.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.pipes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pipes.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Allocate a fresh locally-issued pipe. The 15-bit sequence advances
    /// modulo 2^15 and occupied slots are skipped.
    pub(crate) fn create_local(
        &self,
        priority: i8,
        service_id: &str,
        function_id: u16,
        stream_enabled: bool,
        block_queue_limit: usize,
        poster: Poster,
    ) -> Result<(Pipe, oneshot::Receiver<Outcome>), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mask = if self.inner.primary {
            PRIMARY_PIPE_MASK
        } else {
            0
        };

        for _ in 0..=0x7FFFu16 {
            let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed) & 0x7FFF;
            let id = seq | mask;
            if id == CONTROL_PIPE_ID {
                continue;
            }

            let mut pipes = self.inner.pipes.lock();
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            if pipes.contains_key(&id) {
                continue;
            }
            let (pipe, outcome) = Pipe::new(
                id,
                priority,
                service_id.to_string(),
                function_id,
                stream_enabled,
                block_queue_limit,
                poster,
                Arc::downgrade(&self.inner),
            );
            pipes.insert(id, pipe.clone());
            return Ok((pipe, outcome));
        }
        Err(SessionError::PipesExhausted)
    }

    /// Register the pipe named by a peer's `Open`, validating that the id's
    /// high bit matches the peer's role and that the slot is free.
    pub(crate) fn create_from_open(
        &self,
        open: &Open,
        stream_enabled: bool,
        block_queue_limit: usize,
        poster: Poster,
    ) -> Result<Pipe, ProtocolError> {
        if open.pipe_id == CONTROL_PIPE_ID {
            return Err(ProtocolError::ReservedPipeId);
        }
        let remote_primary = !self.inner.primary;
        if (open.pipe_id & PRIMARY_PIPE_MASK != 0) != remote_primary {
            return Err(ProtocolError::RoleMismatch {
                pipe_id: open.pipe_id,
                remote_primary,
            });
        }

        let mut pipes = self.inner.pipes.lock();
        if pipes.contains_key(&open.pipe_id) {
            return Err(ProtocolError::DuplicatePipeId {
                pipe_id: open.pipe_id,
            });
        }
        let (pipe, _outcome) = Pipe::new(
            open.pipe_id,
            open.priority,
            open.service_id.clone(),
            open.function_id,
            stream_enabled,
            block_queue_limit,
            poster,
            Arc::downgrade(&self.inner),
        );
        pipes.insert(open.pipe_id, pipe.clone());
        Ok(pipe)
    }

    /// Remove an entry. Idempotent.
    pub fn destroy(&self, id: u16) {
        self.inner.remove(id);
    }

    /// Whether `id` belonged to a pipe that terminated not long ago. Late
    /// blocks racing a terminal close are told apart from blocks for pipes
    /// that never existed.
    pub(crate) fn was_recently_closed(&self, id: u16) -> bool {
        self.inner.recently_closed.lock().contains(&id)
    }

    /// Reject further creates and terminate every live pipe. With
    /// `graceful` each pipe is aborted with SessionClosing (emitting its
    /// `Close`); otherwise outcomes fail as on transport loss, emitting
    /// nothing.
    pub(crate) fn close(&self, graceful: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pipes: Vec<Pipe> = {
            let mut map = self.inner.pipes.lock();
            map.drain().map(|(_, pipe)| pipe).collect()
        };
        tracing::debug!(live = pipes.len(), graceful, "pipe space closed");
        for pipe in pipes {
            if graceful {
                pipe.close_with_abort(Abort::session_closing());
            } else {
                pipe.transport_lost();
            }
        }
    }
}

impl std::fmt::Debug for PipeSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeSpace")
            .field("primary", &self.inner.primary)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
