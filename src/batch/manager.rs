//! Batch manager: keyed buffering, flush orchestration and response routing.

use super::buffer::{BatchBuffer, BufferOffer};
use super::config::BatchOverrideConfig;
use super::flush::{CancellableFlush, FlushScheduler};
use super::functions::{BatchAndSend, BatchKeyMapper, BatchResponseMapper};
use super::message::IdentifiableMessage;
use crate::{BoxError, CapacityKind, Error, ErrorContext, Result, SharedError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The buffer reached `max_batch_items`.
    Threshold,
    /// `max_batch_open` elapsed since the buffer became non-empty.
    Timer,
    /// [`BatchManager::flush`] or [`BatchManager::flush_all`].
    Manual,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Threshold => "threshold",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
        }
    }
}

/// Point-in-time view of a manager's counters and tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchManagerSnapshot {
    pub batch_keys: usize,
    /// Entries buffered and not yet flushed.
    pub buffered: usize,
    /// Callers still waiting for a result (buffered or in flight).
    pub pending: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub batches_sent: u64,
    pub threshold_flushes: u64,
    pub timer_flushes: u64,
    pub manual_flushes: u64,
    pub send_failures: u64,
    pub closed: bool,
}

struct AtomicStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    batches_sent: AtomicU64,
    threshold_flushes: AtomicU64,
    timer_flushes: AtomicU64,
    manual_flushes: AtomicU64,
    send_failures: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            threshold_flushes: AtomicU64::new(0),
            timer_flushes: AtomicU64::new(0),
            manual_flushes: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    fn record_flush(&self, trigger: FlushTrigger) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        let counter = match trigger {
            FlushTrigger::Threshold => &self.threshold_flushes,
            FlushTrigger::Timer => &self.timer_flushes,
            FlushTrigger::Manual => &self.manual_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result handle returned by [`BatchManager::submit`].
///
/// Resolves once the request's batch has been sent and demultiplexed, or
/// immediately when the submission was rejected.
pub struct ResponseFuture<Resp> {
    state: ResponseState<Resp>,
}

enum ResponseState<Resp> {
    Failed(Option<Error>),
    Waiting(oneshot::Receiver<Result<Resp>>),
}

impl<Resp> ResponseFuture<Resp> {
    fn waiting(rx: oneshot::Receiver<Result<Resp>>) -> Self {
        Self {
            state: ResponseState::Waiting(rx),
        }
    }

    fn failed(err: Error) -> Self {
        Self {
            state: ResponseState::Failed(Some(err)),
        }
    }
}

impl<Resp> Unpin for ResponseFuture<Resp> {}

impl<Resp> Future for ResponseFuture<Resp> {
    type Output = Result<Resp>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ResponseState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(Error::Closed))),
            // A dropped sender means the manager went away with the entry still queued.
            ResponseState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(Error::Closed))),
        }
    }
}

impl<Resp> std::fmt::Debug for ResponseFuture<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            ResponseState::Failed(_) => "failed",
            ResponseState::Waiting(_) => "waiting",
        };
        f.debug_struct("ResponseFuture").field("state", &state).finish()
    }
}

struct Inner<Req, Resp, B> {
    config: BatchOverrideConfig,
    scheduler: FlushScheduler,
    batch_fn: Arc<dyn BatchAndSend<Req, B>>,
    mapper: Arc<dyn BatchResponseMapper<B, Resp>>,
    key_mapper: Arc<dyn BatchKeyMapper<Req>>,
    buffers: DashMap<String, Arc<BatchBuffer<Req>>>,
    pending: DashMap<String, oneshot::Sender<Result<Resp>>>,
    key_count: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    stats: AtomicStats,
}

/// Groups individually submitted requests by key and sends them in bulk.
///
/// A key's buffer is flushed when it reaches `max_batch_items`, or
/// `max_batch_open` after its first entry arrived, whichever comes first.
/// Each flush hands the batch to the batch-send function on the manager's
/// runtime and routes the demultiplexed results back to the callers.
///
/// Cloning is cheap; clones share the same buffers and may be used from any thread.
pub struct BatchManager<Req, Resp, B> {
    inner: Arc<Inner<Req, Resp, B>>,
}

impl<Req, Resp, B> Clone for BatchManager<Req, Resp, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Resp, B> std::fmt::Debug for BatchManager<Req, Resp, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager").finish_non_exhaustive()
    }
}

impl<Req, Resp, B> BatchManager<Req, Resp, B>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Send + 'static,
{
    pub fn builder() -> BatchManagerBuilder<Req, Resp, B> {
        BatchManagerBuilder::new()
    }

    /// Queue a request for batching.
    ///
    /// Never blocks on I/O. Capacity and closure failures resolve the returned
    /// future immediately; nothing is buffered in that case.
    pub fn submit(&self, request: Req) -> ResponseFuture<Resp> {
        match self.inner.try_submit(request) {
            Ok(rx) => ResponseFuture::waiting(rx),
            Err(e) => {
                self.inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "request rejected");
                ResponseFuture::failed(e)
            }
        }
    }

    /// Flush one key now, regardless of size or timer.
    pub fn flush(&self, batch_key: &str) {
        self.inner.flush_key(batch_key, FlushTrigger::Manual);
    }

    /// Flush every non-empty key now.
    pub fn flush_all(&self) {
        let keys: Vec<String> = self
            .inner
            .buffers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.inner.flush_key(&key, FlushTrigger::Manual);
        }
    }

    /// Stop accepting requests.
    ///
    /// Cancels every armed timer and fails still-buffered requests with
    /// [`Error::Closed`]. Batches already handed to the batch-send function
    /// complete normally. Calling this more than once is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let buffers: Vec<Arc<BatchBuffer<Req>>> = self
            .inner
            .buffers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut dropped = 0usize;
        for buffer in buffers {
            dropped += self.inner.fail_closed(&buffer);
        }
        info!(
            batch_keys = self.inner.buffers.len(),
            dropped, "batch manager closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &BatchOverrideConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> BatchManagerSnapshot {
        let inner = &self.inner;
        let buffered = inner.buffers.iter().map(|entry| entry.value().len()).sum();
        BatchManagerSnapshot {
            batch_keys: inner.buffers.len(),
            buffered,
            pending: inner.pending.len(),
            submitted: inner.stats.submitted.load(Ordering::Relaxed),
            rejected: inner.stats.rejected.load(Ordering::Relaxed),
            batches_sent: inner.stats.batches_sent.load(Ordering::Relaxed),
            threshold_flushes: inner.stats.threshold_flushes.load(Ordering::Relaxed),
            timer_flushes: inner.stats.timer_flushes.load(Ordering::Relaxed),
            manual_flushes: inner.stats.manual_flushes.load(Ordering::Relaxed),
            send_failures: inner.stats.send_failures.load(Ordering::Relaxed),
            closed: inner.closed.load(Ordering::SeqCst),
        }
    }
}

impl<Req, Resp, B> Inner<Req, Resp, B>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Send + 'static,
{
    fn try_submit(self: &Arc<Self>, request: Req) -> Result<oneshot::Receiver<Result<Resp>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let batch_key = self.key_mapper.batch_key(&request);
        let buffer = self.buffer_for(&batch_key)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        // Registered before buffering so a fast flush can always find it.
        self.pending.insert(id.clone(), tx);

        let offer = buffer.offer(
            IdentifiableMessage::new(id.clone(), request),
            self.config.max_batch_items,
            self.config.max_buffer_size,
            || self.arm_timer(&batch_key),
        );
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e);
            }
        };
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        match offer {
            BufferOffer::Buffered { count } => {
                trace!(batch_key = %batch_key, id = %id, count, "request buffered");
            }
            BufferOffer::Full(batch) => {
                self.dispatch(batch_key, batch, FlushTrigger::Threshold);
            }
        }

        // close() raced with this submit and may have missed a freshly created buffer.
        if self.closed.load(Ordering::SeqCst) {
            self.fail_closed(&buffer);
        }
        Ok(rx)
    }

    fn buffer_for(&self, batch_key: &str) -> Result<Arc<BatchBuffer<Req>>> {
        if let Some(buffer) = self.buffers.get(batch_key) {
            return Ok(Arc::clone(buffer.value()));
        }
        match self.buffers.entry(batch_key.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let max = self.config.max_batch_keys;
                let reserved = self
                    .key_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    });
                if reserved.is_err() {
                    return Err(Error::capacity(CapacityKind::MaxBatchKeys, batch_key));
                }
                let buffer = Arc::new(BatchBuffer::new(batch_key));
                entry.insert(Arc::clone(&buffer));
                debug!(batch_key = %batch_key, "batch key created");
                Ok(buffer)
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, batch_key: &str) -> super::flush::ScheduledFlush {
        let weak = Arc::downgrade(self);
        let key = batch_key.to_string();
        let flush = CancellableFlush::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush_key(&key, FlushTrigger::Timer);
            }
        });
        self.scheduler.arm(self.config.max_batch_open, flush)
    }

    fn flush_key(self: &Arc<Self>, batch_key: &str, trigger: FlushTrigger) {
        let Some(buffer) = self.buffers.get(batch_key).map(|b| Arc::clone(b.value())) else {
            return;
        };
        match buffer.take_batch() {
            Ok(batch) => self.dispatch(buffer.batch_key().to_string(), batch, trigger),
            Err(e) => warn!(batch_key = %batch_key, error = %e, "flush skipped"),
        }
    }

    /// Hand a drained batch to the batch-send function on the runtime.
    fn dispatch(
        self: &Arc<Self>,
        batch_key: String,
        batch: Vec<IdentifiableMessage<Req>>,
        trigger: FlushTrigger,
    ) {
        // A timer that lost the race against a threshold flush finds nothing left.
        if batch.is_empty() {
            return;
        }
        self.stats.record_flush(trigger);
        debug!(
            batch_key = %batch_key,
            size = batch.len(),
            trigger = trigger.as_str(),
            "flushing batch"
        );

        let ids: Vec<String> = batch.iter().map(|m| m.id().to_string()).collect();
        let inner = Arc::clone(self);
        self.scheduler.handle().spawn(async move {
            let send_fn = Arc::clone(&inner.batch_fn);
            let key = batch_key.clone();
            let outcome = AssertUnwindSafe(async move { send_fn.send_batch(batch, key).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(response)) => inner.complete(&batch_key, ids, response),
                Ok(Err(e)) => inner.fail_batch(&batch_key, ids, e),
                Err(_) => inner.fail_all(
                    &ids,
                    Error::runtime_with_context(
                        "batch send panicked",
                        ErrorContext::new()
                            .with_field_path(batch_key.clone())
                            .with_source("batch_manager"),
                    ),
                ),
            }
        });
    }

    /// Route each demultiplexed result to its caller.
    ///
    /// Ids the mapper leaves out resolve with [`Error::MissingResponse`]; ids it
    /// invents or repeats are ignored.
    fn complete(&self, batch_key: &str, ids: Vec<String>, response: B) {
        let mapper = Arc::clone(&self.mapper);
        let mapped = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            mapper.map_responses(response)
        })) {
            Ok(mapped) => mapped,
            Err(_) => {
                warn!(batch_key = %batch_key, "response mapper panicked");
                return self.fail_all(
                    &ids,
                    Error::runtime_with_context(
                        "response mapper panicked",
                        ErrorContext::new()
                            .with_field_path(batch_key)
                            .with_source("batch_manager"),
                    ),
                );
            }
        };

        let mut expected: HashSet<String> = ids.into_iter().collect();
        for entry in mapped {
            let (id, result) = entry.into_parts();
            if !expected.remove(&id) {
                warn!(batch_key = %batch_key, id = %id, "ignoring response for unknown or repeated id");
                continue;
            }
            let result = result.map_err(|e| Error::entry(id.as_str(), e));
            self.resolve(&id, result);
        }
        for id in expected {
            warn!(batch_key = %batch_key, id = %id, "no response for request in batch");
            let err = Error::MissingResponse {
                id: id.clone(),
                batch_key: batch_key.to_string(),
            };
            self.resolve(&id, Err(err));
        }
    }

    fn fail_batch(&self, batch_key: &str, ids: Vec<String>, cause: BoxError) {
        self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
        warn!(batch_key = %batch_key, size = ids.len(), error = %cause, "batch send failed");
        let shared: SharedError = Arc::from(cause);
        self.fail_all(&ids, Error::batch_send(batch_key, shared));
    }

    fn fail_all(&self, ids: &[String], err: Error) {
        for id in ids {
            self.resolve(id, Err(err.clone()));
        }
    }

    fn fail_closed(&self, buffer: &BatchBuffer<Req>) -> usize {
        let drained = buffer.close();
        let count = drained.len();
        for entry in drained {
            self.resolve(entry.id(), Err(Error::Closed));
        }
        count
    }

    fn resolve(&self, id: &str, result: Result<Resp>) {
        if let Some((_, tx)) = self.pending.remove(id) {
            // The caller may have dropped its future; nothing left to notify.
            let _ = tx.send(result);
        }
    }
}

/// Builder for [`BatchManager`].
pub struct BatchManagerBuilder<Req, Resp, B> {
    config: BatchOverrideConfig,
    scheduler: Option<FlushScheduler>,
    batch_fn: Option<Arc<dyn BatchAndSend<Req, B>>>,
    mapper: Option<Arc<dyn BatchResponseMapper<B, Resp>>>,
    key_mapper: Option<Arc<dyn BatchKeyMapper<Req>>>,
}

impl<Req, Resp, B> BatchManagerBuilder<Req, Resp, B>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            config: BatchOverrideConfig::default(),
            scheduler: None,
            batch_fn: None,
            mapper: None,
            key_mapper: None,
        }
    }

    pub fn override_config(mut self, config: BatchOverrideConfig) -> Self {
        self.config = config;
        self
    }

    /// Run timers and batch sends on this runtime instead of the current one.
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.scheduler = Some(FlushScheduler::new(handle));
        self
    }

    pub fn scheduler(mut self, scheduler: FlushScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn batch_function(mut self, f: impl BatchAndSend<Req, B> + 'static) -> Self {
        self.batch_fn = Some(Arc::new(f));
        self
    }

    pub fn response_mapper(mut self, f: impl BatchResponseMapper<B, Resp> + 'static) -> Self {
        self.mapper = Some(Arc::new(f));
        self
    }

    pub fn batch_key_mapper(mut self, f: impl BatchKeyMapper<Req> + 'static) -> Self {
        self.key_mapper = Some(Arc::new(f));
        self
    }

    /// Validate the configuration and build the manager.
    ///
    /// Without an explicit scheduler or runtime handle this must be called
    /// from inside a tokio runtime.
    pub fn build(self) -> Result<BatchManager<Req, Resp, B>> {
        self.config.validate()?;
        let batch_fn = self.batch_fn.ok_or_else(|| missing("batch_function"))?;
        let mapper = self.mapper.ok_or_else(|| missing("response_mapper"))?;
        let key_mapper = self.key_mapper.ok_or_else(|| missing("batch_key_mapper"))?;
        let scheduler = match self.scheduler {
            Some(s) => s,
            None => FlushScheduler::current()?,
        };

        debug!(
            max_batch_items = self.config.max_batch_items,
            max_batch_open_ms = self.config.max_batch_open.as_millis() as u64,
            "batch manager created"
        );
        Ok(BatchManager {
            inner: Arc::new(Inner {
                config: self.config,
                scheduler,
                batch_fn,
                mapper,
                key_mapper,
                buffers: DashMap::new(),
                pending: DashMap::new(),
                key_count: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                stats: AtomicStats::new(),
            }),
        })
    }
}

impl<Req, Resp, B> Default for BatchManagerBuilder<Req, Resp, B>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn missing(field: &str) -> Error {
    Error::configuration_with_context(
        "required collaborator not set",
        ErrorContext::new()
            .with_field_path(field)
            .with_source("batch_manager_builder"),
    )
}
