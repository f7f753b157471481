use std::{future::Future, sync::Arc};

use {async_trait::async_trait, futures::future::BoxFuture, serde_json::Value};

use crate::envelope::{Envelope, PublishMeta};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,

    #[error("invalid topic {0:?}")]
    InvalidTopic(String),

    #[error("bus backend {0:?} is not compiled in")]
    Unsupported(String),

    #[error("bus transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Async callback invoked once per delivered envelope.
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

/// Returned by [`MessageBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub pattern: String,
}

/// Publish/subscribe transport.
///
/// Delivery is at-most-once. For a single subscription, envelopes published
/// by one publisher to one topic arrive in publish order.
#[async_trait]
pub trait MessageBus: Send + Sync {
    fn name(&self) -> &str;

    /// Wrap `payload` in an envelope and deliver it to every matching
    /// subscription. `topic` must not contain wildcards.
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        meta: PublishMeta,
    ) -> Result<Envelope, BusError>;

    /// `pattern` may use `*` and a trailing `>`.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: Handler,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Unknown handles are ignored.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError>;

    async fn health(&self) -> Result<(), BusError> {
        Ok(())
    }

    /// Drop all subscriptions. Later publishes fail with [`BusError::Closed`].
    async fn close(&self) -> Result<(), BusError>;
}
