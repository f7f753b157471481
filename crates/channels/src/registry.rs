use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use {
    nachos_routing::{Envelope, topics},
    serde_json::Value,
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use crate::{
    adapter::{ChannelAdapter, ChannelHealth},
    error::ChannelError,
    message::{OutboundMessage, SendResult},
};

struct Entry {
    adapter: Arc<dyn ChannelAdapter>,
    config: Value,
}

/// Registered channel adapters keyed by id.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `config` is handed to the adapter's `initialize` on start.
    pub async fn register(
        &self,
        adapter: Arc<dyn ChannelAdapter>,
        config: Value,
    ) -> Result<(), ChannelError> {
        let id = adapter.id().to_string();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(ChannelError::Duplicate(id));
        }
        entries.insert(id, Entry { adapter, config });
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.entries.read().await.get(id).map(|e| Arc::clone(&e.adapter))
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn snapshot(&self) -> Vec<(String, Arc<dyn ChannelAdapter>, Value)> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.adapter), e.config.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Initialize and start every adapter. One adapter failing does not
    /// prevent the others from starting; failures are returned.
    pub async fn start_all(&self) -> Vec<(String, ChannelError)> {
        let mut failures = Vec::new();
        for (id, adapter, config) in self.snapshot().await {
            let started = async {
                adapter.initialize(&config).await?;
                adapter.start().await
            }
            .await;
            match started {
                Ok(()) => info!(channel = %id, "channel started"),
                Err(e) => {
                    warn!(channel = %id, error = %e, "channel failed to start");
                    failures.push((id, e));
                },
            }
        }
        failures
    }

    /// Stop every adapter, attempting all of them.
    pub async fn stop_all(&self) -> Vec<(String, ChannelError)> {
        let mut failures = Vec::new();
        for (id, adapter, _) in self.snapshot().await {
            if let Err(e) = adapter.stop().await {
                warn!(channel = %id, error = %e, "channel failed to stop");
                failures.push((id, e));
            }
        }
        failures
    }

    pub async fn send(&self, message: &OutboundMessage) -> Result<SendResult, ChannelError> {
        let adapter = self
            .get(&message.channel)
            .await
            .ok_or_else(|| ChannelError::NotRegistered(message.channel.clone()))?;
        Ok(adapter.send_message(message).await)
    }

    /// Hand an envelope from `nachos.channel.<id>.outbound` to adapter `<id>`.
    pub async fn deliver(&self, envelope: &Envelope) -> Result<SendResult, ChannelError> {
        let channel = match topics::parse(&envelope.topic) {
            Some(t) if t.domain == "channel" && t.direction == "outbound" => t.name,
            _ => {
                return Err(ChannelError::adapter(
                    envelope.topic.clone(),
                    "not a channel outbound topic",
                ));
            },
        };
        let mut message: OutboundMessage = serde_json::from_value(envelope.payload.clone())?;
        if message.channel.is_empty() {
            message.channel = channel.to_string();
        } else if message.channel != channel {
            return Err(ChannelError::adapter(
                channel,
                format!("payload addressed to channel {:?}", message.channel),
            ));
        }
        self.send(&message).await
    }

    pub async fn health(&self) -> BTreeMap<String, ChannelHealth> {
        let mut out = BTreeMap::new();
        for (id, adapter, _) in self.snapshot().await {
            out.insert(id, adapter.health_check().await);
        }
        out
    }
}
