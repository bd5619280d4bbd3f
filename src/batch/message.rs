//! Id-tagged message used to correlate entries inside a batch.

/// An immutable `(id, message)` pair.
///
/// Requests travel to the batch-send function as `IdentifiableMessage<Req>`, and
/// the response mapper hands results back in the same shape so each one can be
/// routed to the caller that submitted the matching id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifiableMessage<T> {
    id: String,
    message: T,
}

impl<T> IdentifiableMessage<T> {
    pub fn new(id: impl Into<String>, message: T) -> Self {
        Self {
            id: id.into(),
            message,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }

    pub fn into_parts(self) -> (String, T) {
        (self.id, self.message)
    }

    /// Keep the id, transform the payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> IdentifiableMessage<U> {
        IdentifiableMessage {
            id: self.id,
            message: f(self.message),
        }
    }
}
