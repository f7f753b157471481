//! Bus over NATS core subjects. Envelopes travel as JSON.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use {
    async_nats::connection::State,
    async_trait::async_trait,
    futures::StreamExt,
    serde_json::Value,
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    bus::{BusError, Handler, MessageBus, SubscriptionHandle},
    envelope::{Envelope, PublishMeta},
    memory::{deliver, is_own_worker, next_subscription_id, run_worker},
    topics,
};

struct Subscription {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

pub struct NatsBus {
    client: async_nats::Client,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    closed: AtomicBool,
}

impl NatsBus {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(connect_timeout)
            .connect(url)
            .await
            .map_err(|e| BusError::Transport(format!("{url}: {e}")))?;
        info!(url, "connected to NATS");
        Ok(Self {
            client,
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    fn name(&self) -> &str {
        "nats"
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
        let bytes = serde_json::to_vec(&envelope)?;
        self.client
            .publish(topic.to_string(), bytes.into())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(envelope)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Handler,
    ) -> Result<SubscriptionHandle, BusError> {
        self.ensure_open()?;
        let mut subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        let id = next_subscription_id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = tokio::spawn(run_worker(id, async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = subscriber.next() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                match serde_json::from_slice::<Envelope>(&message.payload) {
                    Ok(envelope) => deliver(&handler, envelope, id).await,
                    Err(e) => warn!(
                        subject = %message.subject,
                        error = %e,
                        "dropping malformed envelope"
                    ),
                }
            }
            let _ = subscriber.unsubscribe().await;
        }));
        self.subscriptions
            .lock()
            .await
            .insert(id, Subscription { cancel, worker });
        debug!(subscription = id, pattern, "subscribed");
        Ok(SubscriptionHandle {
            id,
            pattern: pattern.to_string(),
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError> {
        let removed = self.subscriptions.lock().await.remove(&handle.id);
        if let Some(sub) = removed {
            sub.cancel.cancel();
            // A handler unsubscribing itself must not join its own worker.
            if !is_own_worker(handle.id) {
                let _ = sub.worker.await;
            }
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), BusError> {
        self.ensure_open()?;
        match self.client.connection_state() {
            State::Connected => Ok(()),
            other => Err(BusError::Transport(format!("connection state {other:?}"))),
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let subscriptions: Vec<_> = self.subscriptions.lock().await.drain().collect();
        for (_, sub) in &subscriptions {
            sub.cancel.cancel();
        }
        for (_, sub) in subscriptions {
            let _ = sub.worker.await;
        }
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}
