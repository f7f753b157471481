use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    serde_json::Value,
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, warn},
};

use crate::{
    bus::{BusError, Handler, MessageBus, SubscriptionHandle, handler},
    envelope::{Envelope, PublishMeta},
    topics,
};

// ── Well-known message types ────────────────────────────────────────────────

pub const CHANNEL_INBOUND: &str = "channel.inbound";
pub const CHANNEL_OUTBOUND: &str = "channel.outbound";
pub const LLM_REQUEST: &str = "llm.request";
pub const LLM_RESPONSE: &str = "llm.response";
pub const TOOL_REQUEST: &str = "tool.request";
pub const TOOL_RESPONSE: &str = "tool.response";

/// Dispatches bus envelopes to handlers registered by `meta.type`.
pub struct Router {
    bus: Arc<dyn MessageBus>,
    handlers: RwLock<HashMap<String, Handler>>,
    listeners: Mutex<Vec<SubscriptionHandle>>,
    closed: AtomicBool,
}

impl Router {
    pub fn new(bus: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            handlers: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Register `handler` for `message_type`, returning the one it replaced.
    pub async fn register(&self, message_type: impl Into<String>, handler: Handler) -> Option<Handler> {
        let message_type = message_type.into();
        debug!(message_type = %message_type, "handler registered");
        self.handlers.write().await.insert(message_type, handler)
    }

    pub async fn unregister(&self, message_type: &str) -> bool {
        self.handlers.write().await.remove(message_type).is_some()
    }

    pub async fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.read().await.contains_key(message_type)
    }

    /// Invoke the handler for the envelope's type. Returns `false` when no
    /// handler is registered.
    pub async fn dispatch(&self, envelope: Envelope) -> bool {
        let handler = self
            .handlers
            .read()
            .await
            .get(&envelope.meta.message_type)
            .cloned();
        match handler {
            Some(handler) => {
                handler(envelope).await;
                true
            },
            None => {
                debug!(
                    topic = %envelope.topic,
                    message_type = %envelope.meta.message_type,
                    "no handler for message type"
                );
                false
            },
        }
    }

    /// Subscribe to `pattern` and dispatch everything received on it.
    pub async fn listen(self: &Arc<Self>, pattern: &str) -> Result<SubscriptionHandle, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let router = Arc::downgrade(self);
        let subscription = self
            .bus
            .subscribe(
                pattern,
                handler(move |envelope| {
                    let router = router.clone();
                    async move {
                        if let Some(router) = router.upgrade() {
                            router.dispatch(envelope).await;
                        }
                    }
                }),
            )
            .await?;
        self.listeners.lock().await.push(subscription.clone());
        Ok(subscription)
    }

    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Handler,
    ) -> Result<SubscriptionHandle, BusError> {
        self.bus.subscribe(pattern, handler).await
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        meta: PublishMeta,
    ) -> Result<Envelope, BusError> {
        self.bus.publish(topic, payload, meta).await
    }

    /// Publish on the channel's outbound topic.
    pub async fn send_to_channel(
        &self,
        channel: &str,
        payload: Value,
        correlation_id: Option<String>,
    ) -> Result<Envelope, BusError> {
        let meta = PublishMeta {
            message_type: Some(CHANNEL_OUTBOUND.into()),
            correlation_id,
        };
        self.bus
            .publish(&topics::channel_outbound(channel), payload, meta)
            .await
    }

    /// Drop every listener, then close the bus. Both steps always run.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let listeners: Vec<_> = self.listeners.lock().await.drain(..).collect();
        for listener in &listeners {
            if let Err(e) = self.bus.unsubscribe(listener).await {
                warn!(pattern = %listener.pattern, error = %e, "failed to drop listener");
            }
        }
        self.handlers.write().await.clear();
        self.bus.close().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use {
        super::*,
        crate::memory::InProcessBus,
        serde_json::json,
        tokio::sync::mpsc,
    };

    fn router() -> Arc<Router> {
        Router::new(Arc::new(InProcessBus::new()))
    }

    #[tokio::test]
    async fn dispatches_by_message_type() {
        let router = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .register(
                TOOL_REQUEST,
                handler(move |env: Envelope| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(env.payload);
                    }
                }),
            )
            .await;
        router.listen("nachos.tool.*.request").await.unwrap();

        router
            .publish(&topics::tool_request("browser"), json!("ignored"), PublishMeta::default())
            .await
            .unwrap();
        router
            .publish(
                &topics::tool_request("browser"),
                json!("handled"),
                PublishMeta::typed(TOOL_REQUEST),
            )
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, json!("handled"));
    }

    #[tokio::test]
    async fn dispatch_reports_missing_handler() {
        let router = router();
        let env = Envelope::new("nachos.llm.proxy.response", json!({}), PublishMeta::typed(LLM_RESPONSE));
        assert!(!router.dispatch(env.clone()).await);

        router.register(LLM_RESPONSE, handler(|_| async {})).await;
        assert!(router.dispatch(env.clone()).await);
        assert!(router.unregister(LLM_RESPONSE).await);
        assert!(!router.dispatch(env).await);
    }

    #[tokio::test]
    async fn send_to_channel_uses_outbound_topic() {
        let router = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .subscribe(
                &topics::channel_outbound("slack"),
                handler(move |env: Envelope| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(env);
                    }
                }),
            )
            .await
            .unwrap();

        let sent = router
            .send_to_channel("slack", json!({"text": "hi"}), Some("corr-1".into()))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, sent);
        assert_eq!(got.meta.message_type, CHANNEL_OUTBOUND);
        assert_eq!(got.meta.correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn close_closes_bus_and_rejects_listen() {
        let router = router();
        router.listen(topics::ALL_CHANNELS_INBOUND).await.unwrap();
        router.close().await.unwrap();

        assert!(router.bus().health().await.is_err());
        assert!(matches!(
            router.listen(topics::ALL_CHANNELS_INBOUND).await,
            Err(BusError::Closed)
        ));
        router.close().await.unwrap();
    }
}
