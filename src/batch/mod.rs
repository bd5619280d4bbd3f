//! 请求批处理模块：按键分组缓冲请求，按数量或超时批量发送并分发响应。
//!
//! # Keyed Request Batching Module
//!
//! This module turns individually submitted requests into bulk calls. Requests
//! are grouped by a caller-defined batch key; each group is flushed either when
//! it reaches a size threshold or when a timer expires, and the bulk response is
//! demultiplexed back to every original caller.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchManager`] | Owns the per-key buffers and routes results back to callers |
//! | [`BatchManagerBuilder`] | Wires configuration and collaborators into a manager |
//! | [`BatchOverrideConfig`] | Size threshold, open window and capacity limits |
//! | [`IdentifiableMessage`] | `(id, payload)` pair correlating requests and responses |
//! | [`CancellableFlush`] / [`ScheduledFlush`] | One-shot flush action and its armed timer |
//! | [`BatchAndSend`], [`BatchResponseMapper`], [`BatchKeyMapper`] | Caller-supplied collaborators |
//!
//! ## Example
//!
//! ```rust,no_run
//! use sdk_batcher::batch::{BatchManager, BatchOverrideConfig, IdentifiableMessage};
//! use sdk_batcher::BoxError;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> sdk_batcher::Result<()> {
//!     let manager: BatchManager<String, String, Vec<IdentifiableMessage<String>>> =
//!         BatchManager::builder()
//!             .override_config(
//!                 BatchOverrideConfig::new()
//!                     .with_max_batch_items(10)
//!                     .with_max_batch_open(Duration::from_millis(200)),
//!             )
//!             // One bulk call per key; here it just echoes the payloads.
//!             .batch_function(|requests: Vec<IdentifiableMessage<String>>, _key: String| async move {
//!                 Ok::<_, BoxError>(requests)
//!             })
//!             .response_mapper(|resp: Vec<IdentifiableMessage<String>>| {
//!                 resp.into_iter()
//!                     .map(|m| m.map(Ok::<_, BoxError>))
//!                     .collect::<Vec<_>>()
//!             })
//!             .batch_key_mapper(|req: &String| req.split(' ').next().unwrap_or_default().to_string())
//!             .build()?;
//!
//!     let reply = manager.submit("queue-a hello".to_string()).await?;
//!     assert_eq!(reply, "queue-a hello");
//!     manager.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Flush rules
//!
//! - **Threshold**: the submit that fills a buffer to `max_batch_items` flushes it
//!   synchronously and cancels the pending timer
//! - **Timer**: the first entry into an empty buffer arms a flush after `max_batch_open`
//! - **Manual**: [`BatchManager::flush`] and [`BatchManager::flush_all`]
//!
//! A flush snapshots and clears the buffer under the key's lock, so a timer
//! that loses a race against a threshold flush finds nothing to send.

mod buffer;
mod config;
mod flush;
mod functions;
mod manager;
mod message;

pub use config::{BatchOverrideConfig, DEFAULT_MAX_BATCH_ITEMS, DEFAULT_MAX_BATCH_OPEN};
pub use flush::{CancellableFlush, FlushScheduler, ScheduledFlush};
pub use functions::{BatchAndSend, BatchKeyMapper, BatchResponseMapper};
pub use manager::{
    BatchManager, BatchManagerBuilder, BatchManagerSnapshot, FlushTrigger, ResponseFuture,
};
pub use message::IdentifiableMessage;
