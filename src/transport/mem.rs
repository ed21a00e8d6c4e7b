//! In-process transport pair.
//!
//! Closing one end behaves like a socket shutdown: the peer still drains
//! whatever was already in flight, then observes a clean close.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::error::TransportError;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    /// Sender toward the peer; dropped on close so the peer sees EOF after
    /// draining.
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
    /// Wakes this end's blocked operations when it closes.
    notify: Notify,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = MemTransport {
            inner: Arc::new(MemInner {
                tx: Mutex::new(Some(tx_b)),
                rx: tokio::sync::Mutex::new(rx_a),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        };
        let b = MemTransport {
            inner: Arc::new(MemInner {
                tx: Mutex::new(Some(tx_a)),
                rx: tokio::sync::Mutex::new(rx_b),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        };
        (a, b)
    }

    pub async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut closed = pin!(self.inner.notify.notified());
        closed.as_mut().enable();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let Some(tx) = self.inner.tx.lock().clone() else {
            return Err(TransportError::Closed);
        };
        tokio::select! {
            _ = closed => Err(TransportError::Closed),
            sent = tx.send(frame) => sent.map_err(|_| TransportError::Closed),
        }
    }

    pub async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        let mut closed = pin!(self.inner.notify.notified());
        closed.as_mut().enable();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            _ = closed => Err(TransportError::Closed),
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            *self.inner.tx.lock() = None;
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        let tx = self.inner.tx.lock();
        tx.as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
