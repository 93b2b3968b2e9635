//! sente-queue: a bounded, per-connection outbound FIFO.
//!
//! Producers call [`SendQueue::enqueue`] (non-blocking, rejects at
//! `max_depth`), [`SendQueue::enqueue_blocking`] (awaits free capacity up to
//! a deadline) or [`SendQueue::enqueue_async`] (same, fire-and-forget with a
//! callback). A background flusher drains the buffer into a transport sink
//! in enqueue order, woken by either a periodic tick or an immediate signal
//! on enqueue — never out of order, and backpressure is report-and-drop by
//! default rather than blocking the caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// An already-encoded outbound message.
pub type Message = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Ok,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingEnqueueResult {
    Ok,
    Timeout,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub errors: u64,
    pub depth: usize,
}

struct Shared {
    buffer: Mutex<VecDeque<Message>>,
    not_empty: Notify,
    not_full: Notify,
    max_depth: usize,
    closed: AtomicBool,
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl Shared {
    fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            depth: self.buffer.lock().unwrap().len(),
        }
    }
}

/// A bounded, clonable handle to a per-connection send queue.
#[derive(Clone)]
pub struct SendQueue {
    shared: Arc<Shared>,
}

impl SendQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(VecDeque::new()),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                max_depth,
                closed: AtomicBool::new(false),
                enqueued: AtomicU64::new(0),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }

    /// Non-blocking enqueue. Rejects immediately at `max_depth` or once the
    /// queue has been closed.
    pub fn enqueue(&self, msg: Message) -> EnqueueResult {
        if self.shared.closed.load(Ordering::Acquire) {
            return EnqueueResult::Rejected;
        }
        let mut buf = self.shared.buffer.lock().unwrap();
        if buf.len() >= self.shared.max_depth {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueResult::Rejected;
        }
        buf.push_back(msg);
        drop(buf);
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.not_empty.notify_waiters();
        EnqueueResult::Ok
    }

    /// Enqueue, awaiting free capacity up to `timeout`.
    pub async fn enqueue_blocking(&self, msg: Message, timeout: Duration) -> BlockingEnqueueResult {
        let deadline = Instant::now() + timeout;
        let mut msg = Some(msg);
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return BlockingEnqueueResult::Timeout;
            }
            {
                let mut buf = self.shared.buffer.lock().unwrap();
                if buf.len() < self.shared.max_depth {
                    buf.push_back(msg.take().expect("message consumed exactly once"));
                    drop(buf);
                    self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                    self.shared.not_empty.notify_waiters();
                    return BlockingEnqueueResult::Ok;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return BlockingEnqueueResult::Timeout;
            }
            if tokio::time::timeout(remaining, self.shared.not_full.notified())
                .await
                .is_err()
            {
                return BlockingEnqueueResult::Timeout;
            }
        }
    }

    /// Fire-and-forget variant of [`Self::enqueue_blocking`]; `cb` runs on a
    /// spawned task once the enqueue settles.
    pub fn enqueue_async<F>(&self, msg: Message, timeout: Duration, cb: F)
    where
        F: FnOnce(BlockingEnqueueResult) + Send + 'static,
    {
        let queue = self.clone();
        tokio::spawn(async move {
            let result = queue.enqueue_blocking(msg, timeout).await;
            cb(result);
        });
    }

    async fn drain_into<S, E>(&self, sink: &mut S, on_error: &(dyn Fn(&E, &Message) + Send + Sync))
    where
        S: futures_util::Sink<Message, Error = E> + Unpin,
    {
        loop {
            let next = {
                let mut buf = self.shared.buffer.lock().unwrap();
                let item = buf.pop_front();
                if item.is_some() {
                    self.shared.not_full.notify_waiters();
                }
                item
            };
            let Some(msg) = next else { break };
            match sink.send(msg.clone()).await {
                Ok(()) => {
                    self.shared.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.shared.errors.fetch_add(1, Ordering::Relaxed);
                    on_error(&e, &msg);
                }
            }
        }
    }

    /// Spawn the background flusher: wakes on `flush_interval` or
    /// immediately on enqueue, and always drains in FIFO order.
    pub fn spawn_flusher<S, E>(
        &self,
        mut sink: S,
        flush_interval: Duration,
        on_error: impl Fn(&E, &Message) + Send + Sync + 'static,
    ) -> FlusherHandle
    where
        S: futures_util::Sink<Message, Error = E> + Unpin + Send + 'static,
        E: Send + 'static,
    {
        let queue = self.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let on_error: Arc<dyn Fn(&E, &Message) + Send + Sync> = Arc::new(on_error);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = queue.shared.not_empty.notified() => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
                queue.drain_into(&mut sink, on_error.as_ref()).await;
            }
            // Graceful shutdown: one last drain of whatever arrived after
            // the stop signal but before this task observed it.
            queue.drain_into(&mut sink, on_error.as_ref()).await;
            queue.shared.closed.store(true, Ordering::Release);
            queue.shared.stats()
        });
        FlusherHandle { stop_tx, task: Some(task) }
    }
}

/// Handle to a running flusher task.
pub struct FlusherHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<QueueStats>>,
}

impl FlusherHandle {
    /// Signal the flusher to drain and stop, returning final stats.
    pub async fn stop(mut self) -> QueueStats {
        let _ = self.stop_tx.send(true);
        match self.task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => QueueStats::default(),
        }
    }
}
