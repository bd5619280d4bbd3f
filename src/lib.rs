//! # sdk-batcher
//!
//! 通用请求批处理引擎：按键聚合单个请求，按数量阈值或超时批量发送，并将批量响应分发回各调用方。
//!
//! Generic request-batching engine for SDK clients. Individually submitted
//! requests are grouped by a caller-defined key and sent in bulk, then each
//! caller receives its own slice of the bulk response.
//!
//! ## Core Philosophy
//!
//! - **Transport-Agnostic**: how a batch is sent is a caller-supplied function
//! - **Key-Isolated**: every batch key has its own buffer and lock; busy keys never stall quiet ones
//! - **Bounded**: caps on distinct keys and on buffered entries per key fail fast instead of growing
//! - **No Silent Drops**: every submitted request resolves, with a response or an [`Error`]
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Batch manager, buffers, flush timers and collaborator traits |
//! | [`error`] | Unified error type and capacity classification |

pub mod batch;
pub mod error;

pub use batch::{
    BatchAndSend, BatchKeyMapper, BatchManager, BatchManagerBuilder, BatchManagerSnapshot,
    BatchOverrideConfig, BatchResponseMapper, IdentifiableMessage, ResponseFuture,
};
pub use error::{BoxError, CapacityKind, Error, ErrorContext, SharedError};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
