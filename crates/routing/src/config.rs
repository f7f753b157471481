use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    bus::{BusError, MessageBus},
    memory::InProcessBus,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    #[default]
    Memory,
    Nats,
}

impl BusBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Nats => "nats",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Only used by the `nats` backend.
    pub url: String,
    pub connect_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            url: "nats://127.0.0.1:4222".into(),
            connect_timeout_ms: 5_000,
        }
    }
}

/// Build the configured bus. Selecting `nats` without the feature compiled in
/// is a configuration error, not a silent fallback.
pub async fn connect_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>, BusError> {
    match config.backend {
        BusBackend::Memory => Ok(Arc::new(InProcessBus::new())),
        #[cfg(feature = "nats")]
        BusBackend::Nats => {
            let bus = crate::nats::NatsBus::connect(
                &config.url,
                std::time::Duration::from_millis(config.connect_timeout_ms),
            )
            .await?;
            Ok(Arc::new(bus))
        },
        #[cfg(not(feature = "nats"))]
        BusBackend::Nats => Err(BusError::Unsupported(BusBackend::Nats.as_str().into())),
    }
}
