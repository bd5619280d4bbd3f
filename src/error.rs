use std::sync::Arc;
use thiserror::Error;

/// Error type produced by caller-supplied collaborators (batch-send futures and
/// per-entry results from the response mapper).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared form of [`BoxError`], so one failure can be handed to every caller in a batch.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Batch key or configuration field involved (e.g. "dest0", "max_batch_items")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g. expected range, actual value)
    pub details: Option<String>,
    /// Component that raised the error (e.g. "batch_buffer", "batch_config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Which resource bound rejected a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    /// The request needed a new batch key and `max_batch_keys` keys already exist.
    MaxBatchKeys,
    /// The key's buffer already holds `max_buffer_size` unflushed entries.
    MaxBufferSize,
}

impl std::fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityKind::MaxBatchKeys => f.write_str("max batch keys reached"),
            CapacityKind::MaxBufferSize => f.write_str("max buffer size reached"),
        }
    }
}

/// Unified error type for the batcher.
///
/// Every variant is `Clone`: a single transport failure is delivered to every
/// caller whose request travelled in the failed batch.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Capacity error: {kind} (batch key: {batch_key})")]
    Capacity {
        kind: CapacityKind,
        batch_key: String,
    },

    #[error("Batch manager closed")]
    Closed,

    #[error("Batch send failed for key {batch_key}: {source}")]
    BatchSend {
        batch_key: String,
        #[source]
        source: SharedError,
    },

    #[error("Request {id} failed: {source}")]
    Entry {
        id: String,
        #[source]
        source: SharedError,
    },

    #[error("No response for request {id} in batch for key {batch_key}")]
    MissingResponse { id: String, batch_key: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn capacity(kind: CapacityKind, batch_key: impl Into<String>) -> Self {
        Error::Capacity {
            kind,
            batch_key: batch_key.into(),
        }
    }

    pub(crate) fn batch_send(batch_key: impl Into<String>, source: SharedError) -> Self {
        Error::BatchSend {
            batch_key: batch_key.into(),
            source,
        }
    }

    pub(crate) fn entry(id: impl Into<String>, source: BoxError) -> Self {
        Error::Entry {
            id: id.into(),
            source: Arc::from(source),
        }
    }

    /// Rejected synchronously because a resource bound was hit.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Capacity { .. })
    }

    pub fn capacity_kind(&self) -> Option<CapacityKind> {
        match self {
            Error::Capacity { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Whether resubmitting the same request could succeed.
    ///
    /// The batcher never retries on its own; this only classifies the failure
    /// for a retry layer sitting outside it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BatchSend { .. }
                | Error::Capacity {
                    kind: CapacityKind::MaxBufferSize,
                    ..
                }
        )
    }

    /// Get error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_capacity_messages() {
        let keys = Error::capacity(CapacityKind::MaxBatchKeys, "dest1");
        assert!(keys.is_capacity());
        assert_eq!(keys.capacity_kind(), Some(CapacityKind::MaxBatchKeys));
        assert!(keys.to_string().contains("max batch keys reached"));
        assert!(!keys.is_retryable());

        let size = Error::capacity(CapacityKind::MaxBufferSize, "dest0");
        assert!(size.to_string().contains("max buffer size reached"));
        assert!(size.to_string().contains("dest0"));
        assert!(size.is_retryable());
    }

    #[test]
    fn test_batch_send_keeps_source() {
        let shared: SharedError = Arc::new(Boom);
        let err = Error::batch_send("dest0", shared);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("boom"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("boom"));

        // Clones share the same cause.
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }

    #[test]
    fn test_entry_error_from_box() {
        let err = Error::entry("7", Box::new(Boom));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Request 7 failed: boom");
    }

    #[test]
    fn test_configuration_context_formatting() {
        let err = Error::configuration_with_context(
            "value must be positive",
            ErrorContext::new()
                .with_field_path("max_batch_items")
                .with_source("batch_config"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: value must be positive (field: max_batch_items, source: batch_config)"
        );
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("max_batch_items")
        );
        assert!(Error::Closed.context().is_none());
        assert!(Error::Closed.is_closed());
    }
}
