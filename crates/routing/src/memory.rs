//! Single-process bus.
//!
//! Every subscription owns an unbounded queue drained by its own worker
//! task, so a slow or panicking handler never blocks publishers or other
//! subscribers.

use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::FutureExt,
    serde_json::Value,
    tokio::{
        sync::{RwLock, mpsc},
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use crate::{
    bus::{BusError, Handler, MessageBus, SubscriptionHandle},
    envelope::{Envelope, PublishMeta},
    topics,
};

/// How long `close` waits for a worker to drain its queue.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<Envelope>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
pub struct InProcessBus {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    closed: AtomicBool,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

// ── Subscription workers ────────────────────────────────────────────────────

/// Ids are unique across every bus in the process.
static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static WORKER_SUBSCRIPTION: u64;
}

pub(crate) fn next_subscription_id() -> u64 {
    NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed)
}

/// Run a subscription's worker loop, tagged with its id.
pub(crate) async fn run_worker(id: u64, worker: impl Future<Output = ()>) {
    WORKER_SUBSCRIPTION.scope(id, worker).await;
}

/// True when called from inside the worker of subscription `id`, i.e. a
/// handler unsubscribing itself. Joining that worker would wait on itself.
pub(crate) fn is_own_worker(id: u64) -> bool {
    WORKER_SUBSCRIPTION.try_with(|current| *current == id).unwrap_or(false)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Run one handler invocation, logging instead of propagating a panic.
pub(crate) async fn deliver(handler: &Handler, envelope: Envelope, subscription: u64) {
    let topic = envelope.topic.clone();
    let call = AssertUnwindSafe(async move { handler(envelope).await });
    if let Err(panic) = call.catch_unwind().await {
        warn!(
            subscription,
            topic = %topic,
            panic = panic_message(panic.as_ref()),
            "message handler panicked"
        );
    }
}

async fn drain(id: u64, mut worker: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut worker).await.is_err() {
        warn!(subscription = id, "subscription worker did not drain in time, aborting");
        worker.abort();
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        meta: PublishMeta,
    ) -> Result<Envelope, BusError> {
        self.ensure_open()?;
        if !topics::is_concrete(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        let envelope = Envelope::new(topic, payload, meta);
        let subscribers = self.subscribers.read().await;
        let mut delivered = 0usize;
        for sub in subscribers.values() {
            if topics::matches(&sub.pattern, topic) && sub.tx.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(topic, delivered, "published");
        Ok(envelope)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Handler,
    ) -> Result<SubscriptionHandle, BusError> {
        self.ensure_open()?;
        if pattern.is_empty() || pattern.split('.').any(str::is_empty) {
            return Err(BusError::InvalidTopic(pattern.to_string()));
        }
        let id = next_subscription_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let worker = tokio::spawn(run_worker(id, async move {
            while let Some(envelope) = rx.recv().await {
                deliver(&handler, envelope, id).await;
            }
        }));
        self.subscribers.write().await.insert(id, Subscriber {
            pattern: pattern.to_string(),
            tx,
            worker,
        });
        debug!(subscription = id, pattern, "subscribed");
        Ok(SubscriptionHandle {
            id,
            pattern: pattern.to_string(),
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError> {
        let removed = self.subscribers.write().await.remove(&handle.id);
        if let Some(sub) = removed {
            // Dropping the sender lets the worker finish what is queued.
            drop(sub.tx);
            if is_own_worker(handle.id) {
                debug!(subscription = handle.id, "handler unsubscribed itself");
            } else {
                drain(handle.id, sub.worker).await;
            }
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), BusError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let subscribers: Vec<_> = self.subscribers.write().await.drain().collect();
        let workers: Vec<_> = subscribers
            .into_iter()
            .map(|(id, sub)| {
                drop(sub.tx);
                drain(id, sub.worker)
            })
            .collect();
        futures::future::join_all(workers).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use {
        super::*,
        crate::bus::handler,
        serde_json::json,
        tokio::sync::mpsc::UnboundedReceiver,
    };

    fn collector() -> (Handler, UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = handler(move |env| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(env);
            }
        });
        (h, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn preserves_publish_order_per_subscription() {
        let bus = InProcessBus::new();
        let (h, mut rx) = collector();
        bus.subscribe("nachos.channel.slack.inbound", h).await.unwrap();

        for i in 0..50 {
            bus.publish("nachos.channel.slack.inbound", json!(i), PublishMeta::default())
                .await
                .unwrap();
        }
        for i in 0..50 {
            assert_eq!(next(&mut rx).await.payload, json!(i));
        }
    }

    #[tokio::test]
    async fn wildcard_subscriptions_receive_matching_topics_only() {
        let bus = InProcessBus::new();
        let (h, mut rx) = collector();
        bus.subscribe(topics::ALL_CHANNELS_INBOUND, h).await.unwrap();

        bus.publish("nachos.channel.slack.outbound", json!(0), PublishMeta::default())
            .await
            .unwrap();
        bus.publish("nachos.channel.discord.inbound", json!(1), PublishMeta::default())
            .await
            .unwrap();

        let env = next(&mut rx).await;
        assert_eq!(env.topic, "nachos.channel.discord.inbound");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_delivery() {
        let bus = InProcessBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = handler(move |env: Envelope| {
            let tx = tx.clone();
            async move {
                if env.payload == json!("boom") {
                    panic!("handler failure");
                }
                let _ = tx.send(env);
            }
        });
        bus.subscribe("nachos.tool.x.request", h).await.unwrap();

        for p in ["boom", "after"] {
            bus.publish("nachos.tool.x.request", json!(p), PublishMeta::default())
                .await
                .unwrap();
        }
        assert_eq!(next(&mut rx).await.payload, json!("after"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InProcessBus::new();
        let (h, mut rx) = collector();
        let handle = bus.subscribe("nachos.>", h).await.unwrap();
        bus.unsubscribe(&handle).await.unwrap();
        assert_eq!(bus.subscription_count().await, 0);

        bus.publish(topics::LLM_REQUEST, json!({}), PublishMeta::default())
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn handler_can_unsubscribe_itself_without_stalling() {
        let bus = Arc::new(InProcessBus::new());
        let own: Arc<std::sync::OnceLock<SubscriptionHandle>> = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = {
            let (bus, own) = (Arc::clone(&bus), Arc::clone(&own));
            handler(move |env: Envelope| {
                let (bus, own, tx) = (Arc::clone(&bus), Arc::clone(&own), tx.clone());
                async move {
                    if let Some(handle) = own.get() {
                        bus.unsubscribe(handle).await.unwrap();
                    }
                    let _ = tx.send(env);
                }
            })
        };
        let handle = bus.subscribe(topics::LLM_REQUEST, h).await.unwrap();
        own.set(handle).unwrap();

        bus.publish(topics::LLM_REQUEST, json!(1), PublishMeta::default())
            .await
            .unwrap();
        // Well under the drain timeout.
        let env = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("self-unsubscribe stalled")
            .unwrap();
        assert_eq!(env.payload, json!(1));
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[test]
    fn subscription_ids_are_distinct_across_buses() {
        let a = next_subscription_id();
        let b = next_subscription_id();
        assert_ne!(a, b);
        assert!(!is_own_worker(a));
    }

    #[tokio::test]
    async fn rejects_wildcard_publish_and_publish_after_close() {
        let bus = Arc::new(InProcessBus::new());
        assert!(matches!(
            bus.publish("nachos.channel.*.inbound", json!({}), PublishMeta::default())
                .await,
            Err(BusError::InvalidTopic(_))
        ));

        bus.close().await.unwrap();
        assert!(bus.health().await.is_err());
        assert!(matches!(
            bus.publish(topics::LLM_REQUEST, json!({}), PublishMeta::default())
                .await,
            Err(BusError::Closed)
        ));
        // Second close is a no-op.
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_queued_envelopes() {
        let bus = InProcessBus::new();
        let (h, mut rx) = collector();
        bus.subscribe(topics::LLM_REQUEST, h).await.unwrap();
        for i in 0..10 {
            bus.publish(topics::LLM_REQUEST, json!(i), PublishMeta::default())
                .await
                .unwrap();
        }
        bus.close().await.unwrap();

        let mut seen = 0;
        while rx.recv().await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 10);
    }
}
