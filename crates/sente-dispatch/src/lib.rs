//! sente-dispatch: the receive-side handler registry.
//!
//! Handlers are registered with [`Dispatcher::on`] and matched against
//! inbound [`Event`]s in registration order (FIFO fan-out — every matching
//! handler fires for one message). A handler may be persistent, one-shot
//! (`once`), and/or carry a `timeout` after which it fires exactly once
//! with [`Outcome::Timeout`] if it never matched. Messages that match no
//! handler are buffered so a handler registered moments later still sees
//! them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sente_protocol::{Event, EventId};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a handler's callback is actually told matched.
#[derive(Debug, Clone)]
pub enum Outcome {
    Message(Event),
    Timeout,
    Closed(String),
}

/// What an `on!` registration matches against.
pub enum MatchKind {
    EventId(EventId),
    Any,
    Custom(Arc<dyn Fn(&Event) -> bool + Send + Sync>),
}

impl MatchKind {
    fn matches(&self, event: &Event) -> bool {
        match self {
            MatchKind::EventId(id) => &event.id == id,
            MatchKind::Any => true,
            // A predicate exception is a non-match, never a propagated panic.
            MatchKind::Custom(pred) => {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pred(event))).unwrap_or(false)
            }
        }
    }
}

pub struct OnOptions {
    pub match_kind: MatchKind,
    pub once: bool,
    pub timeout: Option<Duration>,
}

impl OnOptions {
    pub fn event_id(id: EventId) -> Self {
        Self { match_kind: MatchKind::EventId(id), once: false, timeout: None }
    }

    pub fn any() -> Self {
        Self { match_kind: MatchKind::Any, once: false, timeout: None }
    }

    pub fn custom(pred: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self { match_kind: MatchKind::Custom(Arc::new(pred)), once: false, timeout: None }
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub matched: u64,
    pub timed_out: u64,
    pub buffered: u64,
    pub dropped: u64,
}

type Callback = Arc<dyn Fn(Outcome) + Send + Sync>;

struct HandlerEntry {
    id: HandlerId,
    match_kind: MatchKind,
    callback: Callback,
    once: bool,
}

struct TimeoutEntry {
    deadline: Instant,
    handler_id: HandlerId,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimeoutEntry {}
impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

struct Shared {
    handlers: Mutex<Vec<HandlerEntry>>,
    unmatched: Mutex<VecDeque<Event>>,
    max_unmatched: usize,
    on_unmatched: Mutex<Option<Arc<dyn Fn(&Event) + Send + Sync>>>,
    closed: AtomicBool,
    matched: AtomicU64,
    timed_out: AtomicU64,
    buffered: AtomicU64,
    dropped: AtomicU64,
    timeout_heap: Mutex<BinaryHeap<Reverse<TimeoutEntry>>>,
    timeout_notify: Notify,
}

impl Shared {
    fn stats(&self) -> DispatchStats {
        DispatchStats {
            matched: self.matched.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Remove a handler by id, returning its callback if it was still
    /// registered. Used by both `off!` and timeout firing so whichever
    /// wins the race is a no-op for the other.
    fn remove_handler(&self, id: HandlerId) -> Option<Callback> {
        let mut handlers = self.handlers.lock().unwrap();
        let pos = handlers.iter().position(|h| h.id == id)?;
        Some(handlers.remove(pos).callback)
    }
}

/// A live handler registry. Cloning shares the same underlying state.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(max_unmatched: usize) -> Self {
        let shared = Arc::new(Shared {
            handlers: Mutex::new(Vec::new()),
            unmatched: Mutex::new(VecDeque::new()),
            max_unmatched,
            on_unmatched: Mutex::new(None),
            closed: AtomicBool::new(false),
            matched: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timeout_heap: Mutex::new(BinaryHeap::new()),
            timeout_notify: Notify::new(),
        });
        let timeout_shared = shared.clone();
        tokio::spawn(async move { run_timeout_scheduler(timeout_shared).await });
        Self { shared }
    }

    pub fn set_on_unmatched(&self, hook: impl Fn(&Event) + Send + Sync + 'static) {
        *self.shared.on_unmatched.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.stats()
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.lock().unwrap().len()
    }

    /// Register a handler. Immediately attempts to match it against the
    /// buffered tail of unmatched messages (oldest first); matching
    /// entries are consumed. If `once` and a buffered match was found,
    /// the handler fires from the buffer and is never actually inserted
    /// into the live registry.
    pub fn on(&self, opts: OnOptions, callback: impl Fn(Outcome) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId::new();
        let callback: Callback = Arc::new(callback);
        let entry = HandlerEntry { id, match_kind: opts.match_kind, callback: callback.clone(), once: opts.once };

        let mut consumed_from_buffer = false;
        {
            let mut buffer = self.shared.unmatched.lock().unwrap();
            let mut remaining = VecDeque::with_capacity(buffer.len());
            while let Some(msg) = buffer.pop_front() {
                if !consumed_from_buffer && entry.match_kind.matches(&msg) {
                    self.shared.matched.fetch_add(1, Ordering::Relaxed);
                    callback(Outcome::Message(msg));
                    if entry.once {
                        consumed_from_buffer = true;
                    }
                } else {
                    remaining.push_back(msg);
                }
            }
            *buffer = remaining;
        }

        if consumed_from_buffer {
            return id;
        }

        self.shared.handlers.lock().unwrap().push(entry);

        if let Some(timeout) = opts.timeout {
            let deadline = Instant::now() + timeout;
            self.shared
                .timeout_heap
                .lock()
                .unwrap()
                .push(Reverse(TimeoutEntry { deadline, handler_id: id }));
            self.shared.timeout_notify.notify_waiters();
        }

        id
    }

    /// Remove a handler (or all handlers, or all handlers for an event-id).
    /// Returns whether anything was actually removed.
    pub fn off(&self, target: OffTarget) -> bool {
        match target {
            OffTarget::Handler(id) => self.shared.remove_handler(id).is_some(),
            OffTarget::All => {
                let mut handlers = self.shared.handlers.lock().unwrap();
                let had_any = !handlers.is_empty();
                handlers.clear();
                had_any
            }
            OffTarget::EventId(event_id) => {
                let mut handlers = self.shared.handlers.lock().unwrap();
                let before = handlers.len();
                handlers.retain(|h| !matches!(&h.match_kind, MatchKind::EventId(id) if *id == event_id));
                handlers.len() != before
            }
        }
    }

    /// Dispatch one decoded inbound event: fan out to every matching
    /// handler in registration order, removing `once` handlers atomically
    /// before invoking them. Buffers the event if nothing matched.
    pub fn dispatch(&self, event: Event) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }

        let mut to_invoke: Vec<Callback> = Vec::new();
        {
            let mut handlers = self.shared.handlers.lock().unwrap();
            let mut i = 0;
            while i < handlers.len() {
                if handlers[i].match_kind.matches(&event) {
                    if handlers[i].once {
                        let removed = handlers.remove(i);
                        to_invoke.push(removed.callback);
                        continue; // don't advance i; the next element shifted into position i
                    } else {
                        to_invoke.push(handlers[i].callback.clone());
                    }
                }
                i += 1;
            }
        }

        if to_invoke.is_empty() {
            self.buffer_unmatched(event);
            return;
        }

        self.shared.matched.fetch_add(to_invoke.len() as u64, Ordering::Relaxed);
        for callback in to_invoke {
            callback(Outcome::Message(event.clone()));
        }
    }

    fn buffer_unmatched(&self, event: Event) {
        let mut buffer = self.shared.unmatched.lock().unwrap();
        if buffer.len() >= self.shared.max_unmatched {
            if let Some(dropped) = buffer.pop_front() {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(hook) = self.shared.on_unmatched.lock().unwrap().as_ref() {
                    hook(&dropped);
                }
            }
        }
        buffer.push_back(event);
        self.shared.buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// Notify every pending handler with `Closed(reason)`, refuse further
    /// matching, and return final stats plus whatever was still buffered.
    pub fn close(&self, reason: impl Into<String>) -> (DispatchStats, Vec<Event>) {
        let reason = reason.into();
        self.shared.closed.store(true, Ordering::Release);
        self.shared.timeout_notify.notify_waiters();

        let handlers = std::mem::take(&mut *self.shared.handlers.lock().unwrap());
        for handler in &handlers {
            (handler.callback)(Outcome::Closed(reason.clone()));
        }

        let buffered: Vec<Event> = self.shared.unmatched.lock().unwrap().drain(..).collect();
        (self.shared.stats(), buffered)
    }
}

#[derive(Debug, Clone)]
pub enum OffTarget {
    Handler(HandlerId),
    All,
    EventId(EventId),
}

async fn run_timeout_scheduler(shared: Arc<Shared>) {
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let next_deadline = shared.timeout_heap.lock().unwrap().peek().map(|entry| entry.0.deadline);
        match next_deadline {
            None => {
                shared.timeout_notify.notified().await;
            }
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let fired = {
                            let mut heap = shared.timeout_heap.lock().unwrap();
                            heap.pop().map(|Reverse(entry)| entry.handler_id)
                        };
                        if let Some(handler_id) = fired {
                            if let Some(callback) = shared.remove_handler(handler_id) {
                                shared.timed_out.fetch_add(1, Ordering::Relaxed);
                                callback(Outcome::Timeout);
                            }
                        }
                    }
                    _ = shared.timeout_notify.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sente_protocol::event_id;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn ev(ns: &str, name: &str, data: serde_json::Value) -> Event {
        Event::new(EventId::new(ns, name).unwrap(), data)
    }

    #[tokio::test]
    async fn matching_handler_fires_and_non_matching_does_not() {
        let dispatcher = Dispatcher::new(128);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.on(OnOptions::event_id(event_id!("app", "foo")), move |outcome| {
            if let Outcome::Message(_) = outcome {
                hits2.fetch_add(1, Ordering::SeqCst);
            }
        });

        dispatcher.dispatch(ev("app", "bar", json!(null)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(ev("app", "foo", json!(1)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_handler_fires_exactly_once_and_is_removed() {
        let dispatcher = Dispatcher::new(128);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.on(OnOptions::event_id(event_id!("app", "foo")).once(), move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.handler_count(), 1);

        dispatcher.dispatch(ev("app", "foo", json!(1)));
        dispatcher.dispatch(ev("app", "foo", json!(2)));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[tokio::test]
    async fn multiple_handlers_for_same_event_fire_in_registration_order() {
        let dispatcher = Dispatcher::new(128);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            dispatcher.on(OnOptions::event_id(event_id!("app", "foo")), move |_| {
                order.lock().unwrap().push(tag);
            });
        }
        dispatcher.dispatch(ev("app", "foo", json!(null)));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn unmatched_messages_buffer_and_are_delivered_to_late_registrations() {
        let dispatcher = Dispatcher::new(128);
        dispatcher.dispatch(ev("app", "late", json!("payload")));
        assert_eq!(dispatcher.stats().buffered, 1);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.on(OnOptions::event_id(event_id!("app", "late")), move |outcome| {
            if matches!(outcome, Outcome::Message(_)) {
                hits2.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 0, "once-from-buffer registrations default to persistent unless `.once()`");
    }

    #[tokio::test]
    async fn unmatched_buffer_drops_oldest_on_overflow() {
        let dispatcher = Dispatcher::new(2);
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let dropped2 = dropped.clone();
        dispatcher.set_on_unmatched(move |event| dropped2.lock().unwrap().push(event.id.clone()));

        dispatcher.dispatch(ev("app", "a", json!(1)));
        dispatcher.dispatch(ev("app", "b", json!(2)));
        dispatcher.dispatch(ev("app", "c", json!(3)));

        assert_eq!(dispatcher.stats().dropped, 1);
        assert_eq!(dropped.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeout_fires_once_after_expiry_when_never_matched() {
        let dispatcher = Dispatcher::new(128);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        dispatcher.on(
            OnOptions::event_id(event_id!("never", "come")).once().timeout(Duration::from_millis(50)),
            move |outcome| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(matches!(outcome, Outcome::Timeout));
                }
            },
        );
        let fired_as_timeout = tokio::time::timeout(Duration::from_millis(500), rx).await.unwrap().unwrap();
        assert!(fired_as_timeout);
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[tokio::test]
    async fn off_cancels_a_pending_timeout_race_cleanly() {
        let dispatcher = Dispatcher::new(128);
        let id = dispatcher.on(
            OnOptions::event_id(event_id!("never", "come")).timeout(Duration::from_secs(10)),
            |_| {},
        );
        assert!(dispatcher.off(OffTarget::Handler(id)));
        assert!(!dispatcher.off(OffTarget::Handler(id)), "second off! is a no-op");
    }

    #[tokio::test]
    async fn close_notifies_every_pending_handler_and_returns_buffer() {
        let dispatcher = Dispatcher::new(128);
        let closed_reason = Arc::new(Mutex::new(None));
        let closed_reason2 = closed_reason.clone();
        dispatcher.on(OnOptions::any(), move |outcome| {
            if let Outcome::Closed(reason) = outcome {
                *closed_reason2.lock().unwrap() = Some(reason);
            }
        });
        dispatcher.dispatch(ev("app", "unrelated-but-matched-by-any", json!(null)));

        let (stats, buffered) = dispatcher.close("shutdown");
        assert_eq!(closed_reason.lock().unwrap().as_deref(), Some("shutdown"));
        assert!(buffered.is_empty());
        assert!(stats.matched >= 1);
    }

    #[tokio::test]
    async fn custom_predicate_exception_is_treated_as_non_match() {
        let dispatcher = Dispatcher::new(128);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.on(
            OnOptions::custom(|_event| panic!("predicates may misbehave")),
            move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
        );
        dispatcher.dispatch(ev("app", "anything", json!(null)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().buffered, 1);
    }
}
