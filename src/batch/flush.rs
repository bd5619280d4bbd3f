//! Cancellable, timer-driven flush actions.

use crate::{Error, ErrorContext, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// A one-shot unit of work ("flush this key now") that remembers whether it ran.
///
/// Clones share the same action and the same run flag.
#[derive(Clone)]
pub struct CancellableFlush {
    action: Arc<dyn Fn() + Send + Sync>,
    has_run: Arc<AtomicBool>,
}

impl CancellableFlush {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            action: Arc::new(action),
            has_run: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the action unless it already ran. Returns `true` if this call ran it.
    pub fn run(&self) -> bool {
        if self.has_run.swap(true, Ordering::AcqRel) {
            return false;
        }
        (self.action)();
        true
    }

    pub fn has_run(&self) -> bool {
        self.has_run.load(Ordering::Acquire)
    }

    /// Allow the action to run again.
    pub fn reset(&self) {
        self.has_run.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for CancellableFlush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableFlush")
            .field("has_run", &self.has_run())
            .finish()
    }
}

/// A [`CancellableFlush`] armed on the scheduler.
#[derive(Debug)]
pub struct ScheduledFlush {
    flush: CancellableFlush,
    abort: AbortHandle,
}

impl ScheduledFlush {
    /// Best-effort cancel.
    ///
    /// Prevents the action if the timer has not fired yet. Once the action has
    /// started this is a no-op, so the action itself must tolerate running after
    /// a cancel was requested.
    pub fn cancel(&self) {
        if !self.flush.has_run() {
            self.abort.abort();
        }
    }

    pub fn has_run(&self) -> bool {
        self.flush.has_run()
    }
}

/// Shared time-based scheduler backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    handle: Handle,
}

impl FlushScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        Handle::try_current().map(Self::new).map_err(|e| {
            Error::configuration_with_context(
                "no tokio runtime available for the flush scheduler",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("flush_scheduler"),
            )
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `flush` after `delay` unless cancelled first.
    pub fn arm(&self, delay: Duration, flush: CancellableFlush) -> ScheduledFlush {
        let task_flush = flush.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task_flush.run();
        });
        ScheduledFlush {
            flush,
            abort: task.abort_handle(),
        }
    }
}
