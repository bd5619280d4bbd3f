//! Per-key pending entry buffer.

use super::flush::ScheduledFlush;
use super::message::IdentifiableMessage;
use crate::{CapacityKind, Error, ErrorContext, Result};
use std::sync::{Mutex, MutexGuard};

/// Outcome of adding an entry to a [`BatchBuffer`].
#[derive(Debug)]
pub(crate) enum BufferOffer<Req> {
    /// Entry buffered; `count` entries are now waiting.
    Buffered { count: usize },
    /// Entry completed a batch. The buffer was emptied and its timer cancelled;
    /// the caller owns sending these entries.
    Full(Vec<IdentifiableMessage<Req>>),
}

struct BufferState<Req> {
    entries: Vec<IdentifiableMessage<Req>>,
    scheduled: Option<ScheduledFlush>,
    closed: bool,
}

impl<Req> BufferState<Req> {
    fn cancel_scheduled(&mut self) {
        if let Some(scheduled) = self.scheduled.take() {
            scheduled.cancel();
        }
    }
}

/// Entries waiting to be sent for one batch key, plus at most one armed timer.
///
/// Every mutation happens under a single per-key mutex, and the mutex is only
/// held for list swaps and timer bookkeeping, never for I/O.
pub(crate) struct BatchBuffer<Req> {
    batch_key: String,
    state: Mutex<BufferState<Req>>,
}

impl<Req> BatchBuffer<Req> {
    pub(crate) fn new(batch_key: impl Into<String>) -> Self {
        Self {
            batch_key: batch_key.into(),
            state: Mutex::new(BufferState {
                entries: Vec::new(),
                scheduled: None,
                closed: false,
            }),
        }
    }

    pub(crate) fn batch_key(&self) -> &str {
        &self.batch_key
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferState<Req>>> {
        self.state.lock().map_err(|_| {
            Error::runtime_with_context(
                "BatchBuffer poisoned",
                ErrorContext::new()
                    .with_field_path(self.batch_key.clone())
                    .with_source("batch_buffer"),
            )
        })
    }

    /// Append an entry.
    ///
    /// Fails with [`Error::Capacity`] if the buffer already holds
    /// `max_buffer_size` entries, and with [`Error::Closed`] once the buffer was
    /// closed. Reaching `max_batch_items` empties the buffer and returns the
    /// batch; otherwise the first entry into an empty buffer arms a timer via `arm`.
    pub(crate) fn offer(
        &self,
        entry: IdentifiableMessage<Req>,
        max_batch_items: usize,
        max_buffer_size: usize,
        arm: impl FnOnce() -> ScheduledFlush,
    ) -> Result<BufferOffer<Req>> {
        let mut st = self.lock()?;
        if st.closed {
            return Err(Error::Closed);
        }
        if st.entries.len() >= max_buffer_size {
            return Err(Error::capacity(
                CapacityKind::MaxBufferSize,
                self.batch_key.clone(),
            ));
        }
        st.entries.push(entry);
        let count = st.entries.len();
        if count >= max_batch_items {
            st.cancel_scheduled();
            return Ok(BufferOffer::Full(std::mem::take(&mut st.entries)));
        }
        if count == 1 && st.scheduled.is_none() {
            st.scheduled = Some(arm());
        }
        Ok(BufferOffer::Buffered { count })
    }

    /// Snapshot and clear the entries, dropping any armed timer.
    ///
    /// Returns an empty batch when a concurrent flush already drained the buffer.
    pub(crate) fn take_batch(&self) -> Result<Vec<IdentifiableMessage<Req>>> {
        let mut st = self.lock()?;
        st.cancel_scheduled();
        Ok(std::mem::take(&mut st.entries))
    }

    /// Refuse further entries and hand back whatever was still buffered.
    pub(crate) fn close(&self) -> Vec<IdentifiableMessage<Req>> {
        // A poisoned buffer is still drained so its callers get resolved.
        let mut st = match self.state.lock() {
            Ok(st) => st,
            Err(poisoned) => poisoned.into_inner(),
        };
        st.closed = true;
        st.cancel_scheduled();
        std::mem::take(&mut st.entries)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().map(|st| st.entries.len()).unwrap_or(0)
    }

    pub(crate) fn has_scheduled_flush(&self) -> bool {
        self.lock().map(|st| st.scheduled.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::flush::{CancellableFlush, FlushScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(id: usize) -> IdentifiableMessage<String> {
        IdentifiableMessage::new(id.to_string(), format!("dest0 {}", id))
    }

    fn arm_noop(scheduler: &FlushScheduler, armed: &Arc<AtomicUsize>) -> ScheduledFlush {
        armed.fetch_add(1, Ordering::SeqCst);
        scheduler.arm(Duration::from_secs(60), CancellableFlush::new(|| {}))
    }

    #[tokio::test]
    async fn test_first_entry_arms_timer_once() {
        let scheduler = FlushScheduler::current().unwrap();
        let armed = Arc::new(AtomicUsize::new(0));
        let buffer = BatchBuffer::new("dest0");

        for i in 0..3 {
            let offer = buffer
                .offer(entry(i), 10, usize::MAX, || arm_noop(&scheduler, &armed))
                .unwrap();
            assert!(matches!(offer, BufferOffer::Buffered { count } if count == i + 1));
        }
        assert_eq!(armed.load(Ordering::SeqCst), 1);
        assert!(buffer.has_scheduled_flush());
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.batch_key(), "dest0");
    }

    #[tokio::test]
    async fn test_threshold_returns_batch_in_order() {
        let scheduler = FlushScheduler::current().unwrap();
        let armed = Arc::new(AtomicUsize::new(0));
        let buffer = BatchBuffer::new("dest0");

        buffer
            .offer(entry(0), 3, usize::MAX, || arm_noop(&scheduler, &armed))
            .unwrap();
        buffer
            .offer(entry(1), 3, usize::MAX, || arm_noop(&scheduler, &armed))
            .unwrap();
        let offer = buffer
            .offer(entry(2), 3, usize::MAX, || arm_noop(&scheduler, &armed))
            .unwrap();

        match offer {
            BufferOffer::Full(batch) => {
                let ids: Vec<&str> = batch.iter().map(|m| m.id()).collect();
                assert_eq!(ids, vec!["0", "1", "2"]);
            }
            other => panic!("expected full batch, got {:?}", other),
        }
        assert_eq!(buffer.len(), 0);
        assert!(!buffer.has_scheduled_flush());

        // Refilling arms a fresh timer.
        buffer
            .offer(entry(3), 3, usize::MAX, || arm_noop(&scheduler, &armed))
            .unwrap();
        assert_eq!(armed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_buffer_size_limit() {
        let scheduler = FlushScheduler::current().unwrap();
        let armed = Arc::new(AtomicUsize::new(0));
        let buffer = BatchBuffer::new("dest0");

        buffer
            .offer(entry(0), 10, 1, || arm_noop(&scheduler, &armed))
            .unwrap();
        let err = buffer
            .offer(entry(1), 10, 1, || arm_noop(&scheduler, &armed))
            .unwrap_err();
        assert_eq!(err.capacity_kind(), Some(CapacityKind::MaxBufferSize));
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_take_batch_then_empty() {
        let scheduler = FlushScheduler::current().unwrap();
        let armed = Arc::new(AtomicUsize::new(0));
        let buffer = BatchBuffer::new("dest0");
        buffer
            .offer(entry(0), 10, usize::MAX, || arm_noop(&scheduler, &armed))
            .unwrap();

        assert_eq!(buffer.take_batch().unwrap().len(), 1);
        assert!(!buffer.has_scheduled_flush());
        assert!(buffer.take_batch().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let scheduler = FlushScheduler::current().unwrap();
        let armed = Arc::new(AtomicUsize::new(0));
        let buffer = BatchBuffer::new("dest0");
        buffer
            .offer(entry(0), 10, usize::MAX, || arm_noop(&scheduler, &armed))
            .unwrap();

        let drained = buffer.close();
        assert_eq!(drained.len(), 1);
        assert!(!buffer.has_scheduled_flush());

        let err = buffer
            .offer(entry(1), 10, usize::MAX, || arm_noop(&scheduler, &armed))
            .unwrap_err();
        assert!(err.is_closed());
    }
}
