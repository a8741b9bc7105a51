//! Signal pipeline: bounded queues between decoders and the inspection
//! engine.
//!
//! Producers never block: a push onto a full queue drops the frame and
//! increments a counter that is surfaced through [`SignalQueue::dropped`]
//! and a rate-limited warning. The [`SignalDistributor`] fans one push out
//! to every registered consumer queue; registration is dynamic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use crate::types::SignalFrame;

/// Bounded multi-producer/single-consumer queue of [`SignalFrame`]s.
pub struct SignalQueue {
    name: String,
    capacity: usize,
    inner: Mutex<VecDeque<SignalFrame>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl SignalQueue {
    /// Create a queue holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue a frame without blocking.
    ///
    /// Returns `false` if the queue was full; the frame is dropped and
    /// counted.
    pub fn push(&self, frame: SignalFrame) -> bool {
        {
            let mut queue = self.inner.lock().expect("signal queue poisoned");
            if queue.len() >= self.capacity {
                drop(queue);
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 1000 == 1 {
                    warn!(queue = %self.name, dropped, "signal queue full, dropping frames");
                }
                return false;
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue the oldest frame, if any.
    pub fn pop(&self) -> Option<SignalFrame> {
        self.inner
            .lock()
            .expect("signal queue poisoned")
            .pop_front()
    }

    /// Dequeue the oldest frame, waiting up to `timeout` for one to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<SignalFrame> {
        if let Some(frame) = self.pop() {
            return Some(frame);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
            if let Some(frame) = self.pop() {
                return Some(frame);
            }
        }
    }

    /// Number of frames currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("signal queue poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wake a consumer blocked in [`SignalQueue::pop_timeout`].
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Fans one produced frame out to every registered consumer queue.
///
/// Consumers attach and detach at any time; frames pushed concurrently with
/// a detach may be dropped, which is acceptable to all consumers by
/// contract.
#[derive(Default)]
pub struct SignalDistributor {
    consumers: RwLock<Vec<Arc<SignalQueue>>>,
}

impl SignalDistributor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer queue.
    pub fn register(&self, queue: Arc<SignalQueue>) {
        self.consumers
            .write()
            .expect("distributor poisoned")
            .push(queue);
    }

    /// Detach a previously attached consumer queue.
    pub fn deregister(&self, queue: &Arc<SignalQueue>) {
        self.consumers
            .write()
            .expect("distributor poisoned")
            .retain(|c| !Arc::ptr_eq(c, queue));
    }

    /// Push a frame to all consumers.
    ///
    /// Returns `true` when every consumer accepted the frame.
    pub fn push(&self, frame: &SignalFrame) -> bool {
        let consumers = self.consumers.read().expect("distributor poisoned");
        let mut all_accepted = true;
        for consumer in consumers.iter() {
            all_accepted &= consumer.push(frame.clone());
        }
        all_accepted
    }
}

impl std::fmt::Debug for SignalDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let consumers = self.consumers.read().expect("distributor poisoned");
        f.debug_struct("SignalDistributor")
            .field("consumers", &consumers.len())
            .finish()
    }
}
