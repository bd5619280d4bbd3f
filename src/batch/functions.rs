//! Caller-supplied collaborators: key mapping, batch sending, response demultiplexing.
//!
//! Each trait has a blanket impl for plain closures, so most callers never
//! name these traits directly.

use super::message::IdentifiableMessage;
use crate::BoxError;
use futures::future::BoxFuture;
use std::future::Future;

/// Derives the batch key for a request. Must be pure and deterministic.
pub trait BatchKeyMapper<Req>: Send + Sync {
    fn batch_key(&self, request: &Req) -> String;
}

impl<Req, F> BatchKeyMapper<Req> for F
where
    F: Fn(&Req) -> String + Send + Sync,
{
    fn batch_key(&self, request: &Req) -> String {
        self(request)
    }
}

/// Sends one batch for one key and resolves to the bulk response.
///
/// May be invoked concurrently for different keys. The returned future is
/// driven on the manager's runtime, so the call itself must not block.
pub trait BatchAndSend<Req, B>: Send + Sync {
    fn send_batch(
        &self,
        requests: Vec<IdentifiableMessage<Req>>,
        batch_key: String,
    ) -> BoxFuture<'static, std::result::Result<B, BoxError>>;
}

impl<Req, B, F, Fut> BatchAndSend<Req, B> for F
where
    F: Fn(Vec<IdentifiableMessage<Req>>, String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<B, BoxError>> + Send + 'static,
{
    fn send_batch(
        &self,
        requests: Vec<IdentifiableMessage<Req>>,
        batch_key: String,
    ) -> BoxFuture<'static, std::result::Result<B, BoxError>> {
        Box::pin(self(requests, batch_key))
    }
}

/// Splits a bulk response into per-request results, keyed by request id.
pub trait BatchResponseMapper<B, Resp>: Send + Sync {
    fn map_responses(
        &self,
        batch_response: B,
    ) -> Vec<IdentifiableMessage<std::result::Result<Resp, BoxError>>>;
}

impl<B, Resp, F> BatchResponseMapper<B, Resp> for F
where
    F: Fn(B) -> Vec<IdentifiableMessage<std::result::Result<Resp, BoxError>>> + Send + Sync,
{
    fn map_responses(
        &self,
        batch_response: B,
    ) -> Vec<IdentifiableMessage<std::result::Result<Resp, BoxError>>> {
        self(batch_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_key_mapper() {
        let mapper = |req: &String| req[..5].to_string();
        assert_eq!(mapper.batch_key(&"dest3 17".to_string()), "dest3");
    }

    #[tokio::test]
    async fn test_closure_batch_and_send() {
        let send = |requests: Vec<IdentifiableMessage<u32>>, key: String| async move {
            Ok::<_, BoxError>(format!("{}:{}", key, requests.len()))
        };
        let batch = vec![IdentifiableMessage::new("0", 1), IdentifiableMessage::new("1", 2)];
        let out = send.send_batch(batch, "dest0".to_string()).await.unwrap();
        assert_eq!(out, "dest0:2");
    }

    #[test]
    fn test_closure_response_mapper() {
        let mapper = |resp: Vec<(String, u32)>| {
            resp.into_iter()
                .map(|(id, n)| IdentifiableMessage::new(id, Ok::<_, BoxError>(n * 10)))
                .collect::<Vec<_>>()
        };
        let mapped = mapper.map_responses(vec![("a".to_string(), 1)]);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].id(), "a");
        assert_eq!(*mapped[0].message().as_ref().unwrap(), 10);
    }
}
