//! Controller-side correlation of bridged HTTP exchanges.
//!
//! A bridge pairs an operator request waiting on the controller with a byte
//! stream the agent produces (push, `PUT /api/bridge/push`) or consumes
//! (pull, `GET /api/bridge/pull`). The operator side opens the bridge before
//! sending the triggering action; the agent side matches it by id when its
//! HTTP exchange arrives.
//!
//! ## Lifecycle
//!
//! ```text
//!   open ──► pending ──match──► matched ──complete──► (removed)
//!               │
//!               ├──timeout──► (removed, waiter gets Timeout)
//!               └──cancel───► (removed, no on_finish)
//! ```
//!
//! Removal under the table lock is the single point of truth: whichever of
//! match, timeout or cancel claims the pending record first wins, and every
//! later attempt sees an unknown id. The timeout only applies while the record
//! is pending; once matched, the waiter follows the stream to its end without
//! a time limit.
//!
//! Ids are single-use. Removed ids are remembered (the most recent
//! [`RETIRED_IDS`]) and refused by [`BridgeCorrelator::open`], so a late
//! agent exchange for a finished bridge can never land on a new one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Boxed body stream carried across a bridge.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Transfer headers that travel with a bridged stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMeta {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub encoding: Option<String>,
    pub content_length: Option<u64>,
}

pub struct BridgeStream {
    pub meta: StreamMeta,
    pub body: ByteStream,
}

impl BridgeStream {
    pub fn new(meta: StreamMeta, body: ByteStream) -> Self {
        Self { meta, body }
    }
}

/// Which way the bytes flow, seen from the agent.
pub enum Direction {
    /// The agent uploads; the operator waits for the stream.
    Push,
    /// The agent downloads the supplied stream.
    Pull(BridgeStream),
}

impl Direction {
    fn name(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull(_) => "pull",
        }
    }
}

/// How a matched stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge timed out waiting for the agent")]
    Timeout,
    #[error("unknown or expired bridge")]
    NotFound,
    #[error("bridge id already in use")]
    Duplicate,
    #[error("bridge direction mismatch")]
    WrongDirection,
    #[error("bridge cancelled")]
    Cancelled,
}

type PushHook = Box<dyn FnOnce(&StreamMeta) + Send>;
type FinishHook = Box<dyn FnOnce(Outcome) + Send>;

/// Hooks attached to a bridge record at open time.
///
/// `on_push` runs once when the agent's exchange is matched, before any byte
/// flows. `on_finish` runs once when the matched stream ends. Neither runs
/// after a timeout or cancel. Both are invoked outside the table lock.
#[derive(Default)]
pub struct Callbacks {
    on_push: Option<PushHook>,
    on_finish: Option<FinishHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_push(mut self, f: impl FnOnce(&StreamMeta) + Send + 'static) -> Self {
        self.on_push = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_finish(mut self, f: impl FnOnce(Outcome) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }
}

enum Endpoint {
    Push(oneshot::Sender<BridgeStream>),
    Pull(BridgeStream),
}

enum RecordState {
    Pending(Endpoint),
    Matched,
}

struct BridgeRecord {
    state: RecordState,
    callbacks: Callbacks,
    /// Completion listeners: the opener's handle, plus the agent-side
    /// handler for pushes.
    listeners: Vec<oneshot::Sender<Outcome>>,
    created: Instant,
}

impl BridgeRecord {
    /// Put back a state that did not match the caller's direction.
    fn restore(&mut self, state: RecordState) -> BridgeError {
        let err = match state {
            RecordState::Pending(_) => BridgeError::WrongDirection,
            RecordState::Matched => BridgeError::NotFound,
        };
        self.state = state;
        err
    }
}

/// Finished ids remembered for reuse checks.
pub const RETIRED_IDS: usize = 4096;

#[derive(Default)]
struct Table {
    live: HashMap<String, BridgeRecord>,
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
}

impl Table {
    fn in_use(&self, id: &str) -> bool {
        self.live.contains_key(id) || self.retired.contains(id)
    }

    /// Remove `id` and retire it.
    fn take(&mut self, id: &str) -> Option<BridgeRecord> {
        let record = self.live.remove(id)?;
        if self.retired_order.len() == RETIRED_IDS {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(id.to_string());
        self.retired_order.push_back(id.to_string());
        Some(record)
    }
}

/// Table of in-flight bridges. Cheap to clone.
#[derive(Clone)]
pub struct BridgeCorrelator {
    records: Arc<Mutex<Table>>,
    timeout: Duration,
}

impl BridgeCorrelator {
    /// `timeout` bounds how long a bridge may stay unmatched.
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(Table::default())),
            timeout,
        }
    }

    /// Register bridge `id`. The returned handle must be awaited (or dropped)
    /// by the opener; dropping it while still pending removes the record.
    ///
    /// Fails with [`BridgeError::Duplicate`] if `id` is live or was recently
    /// used.
    pub fn open(&self, id: &str, direction: Direction, callbacks: Callbacks) -> Result<BridgeHandle, BridgeError> {
        let created = Instant::now();
        let (done_tx, done_rx) = oneshot::channel();
        let kind = direction.name();
        let (endpoint, delivery) = match direction {
            Direction::Push => {
                let (tx, rx) = oneshot::channel();
                (Endpoint::Push(tx), Some(rx))
            }
            Direction::Pull(source) => (Endpoint::Pull(source), None),
        };

        {
            let mut records = self.records.lock();
            if records.in_use(id) {
                return Err(BridgeError::Duplicate);
            }
            records.live.insert(
                id.to_string(),
                BridgeRecord {
                    state: RecordState::Pending(endpoint),
                    callbacks,
                    listeners: vec![done_tx],
                    created,
                },
            );
        }
        debug!(bridge = %id, direction = kind, "bridge opened");

        Ok(BridgeHandle {
            id: id.to_string(),
            deadline: created + self.timeout,
            correlator: self.clone(),
            delivery,
            done: done_rx,
        })
    }

    /// Match an arriving agent upload against pending push bridge `id`.
    ///
    /// Hands the stream to the waiting opener and returns a receiver that
    /// resolves once the opener has drained (or abandoned) it.
    pub fn match_push(&self, id: &str, stream: BridgeStream) -> Result<oneshot::Receiver<Outcome>, BridgeError> {
        let (finished_tx, finished_rx) = oneshot::channel();
        let (deliver, on_push) = {
            let mut records = self.records.lock();
            let record = records.live.get_mut(id).ok_or(BridgeError::NotFound)?;
            let deliver = match std::mem::replace(&mut record.state, RecordState::Matched) {
                RecordState::Pending(Endpoint::Push(deliver)) => deliver,
                other => return Err(record.restore(other)),
            };
            record.listeners.push(finished_tx);
            (deliver, record.callbacks.on_push.take())
        };
        info!(bridge = %id, file = ?stream.meta.file_name, "push bridge matched");

        if let Some(hook) = on_push {
            hook(&stream.meta);
        }
        let tracked = self.track(id, stream);
        if deliver.send(tracked).is_err() {
            // The opener is gone. Dropping the returned stream completes the
            // bridge as failed.
            debug!(bridge = %id, "push bridge opener went away");
        }
        Ok(finished_rx)
    }

    /// Match an agent download against pending pull bridge `id`, returning
    /// the opener's source stream.
    pub fn match_pull(&self, id: &str) -> Result<BridgeStream, BridgeError> {
        let (source, on_push) = {
            let mut records = self.records.lock();
            let record = records.live.get_mut(id).ok_or(BridgeError::NotFound)?;
            let source = match std::mem::replace(&mut record.state, RecordState::Matched) {
                RecordState::Pending(Endpoint::Pull(source)) => source,
                other => return Err(record.restore(other)),
            };
            (source, record.callbacks.on_push.take())
        };
        info!(bridge = %id, "pull bridge matched");

        if let Some(hook) = on_push {
            hook(&source.meta);
        }
        Ok(self.track(id, source))
    }

    /// Release bridge `id`, invoking `on_finish` and waking every listener.
    pub fn complete(&self, id: &str, outcome: Outcome) -> bool {
        let Some(mut record) = self.records.lock().take(id) else {
            return false;
        };
        debug!(
            bridge = %id,
            ?outcome,
            elapsed_ms = u64::try_from(record.created.elapsed().as_millis()).unwrap_or(u64::MAX),
            "bridge finished"
        );
        if let Some(hook) = record.callbacks.on_finish.take() {
            hook(outcome);
        }
        for listener in record.listeners.drain(..) {
            let _ = listener.send(outcome);
        }
        true
    }

    /// Release bridge `id` without invoking `on_finish`. Waiters observe
    /// [`BridgeError::Cancelled`].
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.records.lock().take(id).is_some();
        if removed {
            debug!(bridge = %id, "bridge cancelled");
        }
        removed
    }

    /// Remove `id` if it is still unmatched. Returns `true` if this call
    /// removed it.
    fn expire(&self, id: &str) -> bool {
        let mut records = self.records.lock();
        match records.live.get(id) {
            Some(record) if matches!(record.state, RecordState::Pending(_)) => records.take(id).is_some(),
            _ => false,
        }
    }

    fn track(&self, id: &str, stream: BridgeStream) -> BridgeStream {
        let remaining = stream.meta.content_length;
        let body = TrackedStream {
            inner: stream.body,
            remaining,
            correlator: self.clone(),
            id: id.to_string(),
            finished: false,
        };
        BridgeStream {
            meta: stream.meta,
            body: Box::pin(body),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().live.contains_key(id)
    }
}

/// The opener's side of a bridge.
pub struct BridgeHandle {
    id: String,
    deadline: Instant,
    correlator: BridgeCorrelator,
    delivery: Option<oneshot::Receiver<BridgeStream>>,
    done: oneshot::Receiver<Outcome>,
}

impl BridgeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the agent's upload on a push bridge.
    ///
    /// Fails with [`BridgeError::Timeout`] if nothing matched within the
    /// bridge timeout. The returned stream completes the bridge when it is
    /// drained or dropped.
    pub async fn accept(&mut self) -> Result<BridgeStream, BridgeError> {
        let Some(mut delivery) = self.delivery.take() else {
            return Err(BridgeError::WrongDirection);
        };
        tokio::select! {
            res = &mut delivery => res.map_err(|_| BridgeError::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => {
                if self.correlator.expire(&self.id) {
                    warn!(bridge = %self.id, "bridge timed out");
                    return Err(BridgeError::Timeout);
                }
                delivery.await.map_err(|_| BridgeError::Cancelled)
            }
        }
    }

    /// Wait until the bridged stream has ended.
    ///
    /// The timeout applies only while the bridge is unmatched.
    pub async fn finished(mut self) -> Result<Outcome, BridgeError> {
        tokio::select! {
            res = &mut self.done => res.map_err(|_| BridgeError::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => {
                if self.correlator.expire(&self.id) {
                    warn!(bridge = %self.id, "bridge timed out");
                    return Err(BridgeError::Timeout);
                }
                (&mut self.done).await.map_err(|_| BridgeError::Cancelled)
            }
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if self.correlator.expire(&self.id) {
            debug!(bridge = %self.id, "bridge abandoned before match");
        }
    }
}

/// Wraps a matched stream so that reaching its end, failing, or being dropped
/// completes the bridge exactly once.
struct TrackedStream {
    inner: ByteStream,
    /// Bytes still expected when the length is known. A consumer that stops
    /// polling after the last declared byte still counts as complete.
    remaining: Option<u64>,
    correlator: BridgeCorrelator,
    id: String,
    finished: bool,
}

impl TrackedStream {
    fn finish(&mut self, outcome: Outcome) {
        if !self.finished {
            self.finished = true;
            self.correlator.complete(&self.id, outcome);
        }
    }
}

impl Stream for TrackedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(None) => this.finish(Outcome::Completed),
            Poll::Ready(Some(Err(_))) => this.finish(Outcome::Failed),
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(remaining) = this.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(chunk.len() as u64);
                }
            }
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        let outcome = if self.remaining == Some(0) {
            Outcome::Completed
        } else {
            Outcome::Failed
        };
        self.finish(outcome);
    }
}
