//! Cooperative-backpressure message queue.
//!
//! A `MessageQueue` is an in-order FIFO with an *advisory* capacity: `offer`
//! is never rejected for size, but listeners get edge-triggered readiness
//! signals as the size crosses zero (`pollable`) or the cooperative limit
//! (`offerable`). Producers are expected, not forced, to pause while the
//! queue is not offerable; the wire uses the same signal to gate transport
//! auto-read.
//!
//! Listeners fire outside the queue's critical section and are serialized
//! per queue, so a listener may call back into queue operations without
//! deadlocking.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::QueueClosed;

/// Default cooperative limit for wire-level queues.
pub const DEFAULT_COOPERATIVE_LIMIT: usize = 32_767;

/// Edge-triggered readiness callbacks for one queue.
///
/// Callbacks may add or remove listeners and may re-enter queue operations;
/// notifications for one queue never run concurrently and follow the
/// linearized offer/poll order.
pub trait QueueListener: Send + Sync {
    /// Fired with `true` when the queue becomes non-empty, `false` when it
    /// drains.
    fn pollable_changed(&self, pollable: bool);

    /// Fired with `false` when the size first exceeds the cooperative
    /// limit, `true` when it falls back within it.
    fn offerable_changed(&self, offerable: bool);
}

enum QueueEvent {
    Pollable(bool),
    Offerable(bool),
}

enum Take<T> {
    Item(T),
    Empty,
    EndOfStream,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded-advisory FIFO; see the module docs.
pub struct MessageQueue<T> {
    name: String,
    limit: usize,
    state: Mutex<QueueState<T>>,
    /// Listener events in linearization order, awaiting dispatch.
    pending: Mutex<VecDeque<QueueEvent>>,
    /// Held by whichever thread is currently dispatching listener events.
    notifier: Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn QueueListener>>>,
    notify: Notify,
}

impl<T> MessageQueue<T> {
    /// Create a queue. A `cooperative_limit` of zero is clamped to one.
    pub fn new(name: impl Into<String>, cooperative_limit: usize) -> Self {
        MessageQueue {
            name: name.into(),
            limit: cooperative_limit.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            pending: Mutex::new(VecDeque::new()),
            notifier: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cooperative_limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn QueueListener>) {
        self.listeners
            .lock()
            .retain(|other| !Arc::ptr_eq(other, listener));
    }

    /// Append an item. Never blocks and is never rejected for size; fails
    /// only once the queue is closed.
    pub fn offer(&self, item: T) -> Result<(), QueueClosed> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            let len = state.items.len();
            state.items.push_back(item);

            let mut pending = self.pending.lock();
            if len == 0 {
                pending.push_back(QueueEvent::Pollable(true));
            }
            if len == self.limit {
                pending.push_back(QueueEvent::Offerable(false));
            }
        }
        self.notify.notify_one();
        self.dispatch_events();
        Ok(())
    }

    /// Remove and return the head. With `timeout` of `None` this waits
    /// until an item arrives or the queue closes; `Some(t)` waits at most
    /// `t`. Returns `None` on timeout or end-of-stream. Cancellation-safe:
    /// dropping the future leaves the queue untouched.
    pub async fn poll(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            match self.try_take() {
                Take::Item(item) => {
                    self.dispatch_events();
                    return Some(item);
                }
                Take::EndOfStream => return None,
                Take::Empty => {}
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return match self.try_take() {
                            Take::Item(item) => {
                                self.dispatch_events();
                                Some(item)
                            }
                            _ => None,
                        };
                    }
                }
            }
        }
    }

    fn try_take(&self) -> Take<T> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                let len = state.items.len();
                let mut pending = self.pending.lock();
                if len == 0 {
                    pending.push_back(QueueEvent::Pollable(false));
                }
                if len == self.limit {
                    pending.push_back(QueueEvent::Offerable(true));
                }
                drop(pending);
                if !state.items.is_empty() {
                    // Chain the wakeup so a second waiter is not stranded.
                    self.notify.notify_one();
                }
                Take::Item(item)
            }
            None if state.closed => Take::EndOfStream,
            None => Take::Empty,
        }
    }

    /// Close the queue. Idempotent. Remaining items stay pollable; once
    /// they drain, every poller observes end-of-stream.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        tracing::trace!(queue = %self.name, "queue closed");
        self.notify.notify_waiters();
    }

    /// Deliver pending listener events. Whoever wins the notifier lock
    /// drains the event queue; losers return immediately, their events are
    /// delivered by the winner. Listeners run with no queue lock held.
    fn dispatch_events(&self) {
        loop {
            {
                let Some(_guard) = self.notifier.try_lock() else {
                    return;
                };
                loop {
                    let event = self.pending.lock().pop_front();
                    let Some(event) = event else { break };
                    let listeners: Vec<Arc<dyn QueueListener>> = self.listeners.lock().clone();
                    for listener in &listeners {
                        match event {
                            QueueEvent::Pollable(value) => listener.pollable_changed(value),
                            QueueEvent::Offerable(value) => listener.offerable_changed(value),
                        }
                    }
                }
            }
            // An event may have been queued between the drain and the
            // guard release; retry unless someone else picked it up.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }
}

impl<T: Send + 'static> MessageQueue<T> {
    /// A finite, non-restartable sequence over this queue, terminating at
    /// end-of-stream.
    pub fn stream(self: Arc<Self>) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |queue| async move {
            let item = queue.poll(None).await?;
            Some((item, queue))
        })
    }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
