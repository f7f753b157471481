use std::sync::Arc;

use {
    anyhow::Context,
    nachos_audit::{AuditLogger, AuditProviderRegistry},
    nachos_channels::{ChannelAdapter, ChannelRegistry},
    nachos_config::NachosConfig,
    nachos_policy::PolicyEngine,
    nachos_ratelimit::RateLimiter,
    nachos_routing::{MessageBus, Router, connect_bus},
    nachos_sessions::{SessionManager, SqliteStateStore, StateStore},
    serde_json::Value,
    tracing::{info, warn},
};

use crate::gateway::{Gateway, Parts};

/// Assembles a [`Gateway`]. Anything not supplied explicitly is built from
/// the config.
pub struct GatewayBuilder {
    config: NachosConfig,
    state: Option<Arc<dyn StateStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    rate_limiter: Option<RateLimiter>,
    audit: Option<AuditLogger>,
    audit_registry: AuditProviderRegistry,
    channels: Vec<(Arc<dyn ChannelAdapter>, Value)>,
}

impl GatewayBuilder {
    pub fn new(config: NachosConfig) -> Self {
        Self {
            config,
            state: None,
            bus: None,
            rate_limiter: None,
            audit: None,
            audit_registry: AuditProviderRegistry::new(),
            channels: Vec::new(),
        }
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state = Some(store);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_audit_logger(mut self, logger: AuditLogger) -> Self {
        self.audit = Some(logger);
        self
    }

    /// Factories for `custom` audit providers named in the config.
    pub fn with_audit_registry(mut self, registry: AuditProviderRegistry) -> Self {
        self.audit_registry = registry;
        self
    }

    pub fn with_channel(mut self, adapter: Arc<dyn ChannelAdapter>, config: Value) -> Self {
        self.channels.push((adapter, config));
        self
    }

    pub async fn build(self) -> anyhow::Result<Arc<Gateway>> {
        let config = self.config;
        let mode = config.gateway.security_mode;

        let state = match self.state {
            Some(state) => state,
            None => {
                let store = SqliteStateStore::connect(&config.state)
                    .await
                    .with_context(|| {
                        format!("opening state database {}", config.state.db_path)
                    })?;
                Arc::new(store)
            },
        };

        let audit = match self.audit {
            Some(audit) => audit,
            None => AuditLogger::from_config(&config.audit, &self.audit_registry)
                .await
                .context("invalid audit configuration")?,
        };

        let rate_limiter = match self.rate_limiter {
            Some(limiter) => limiter,
            None => RateLimiter::new(&config.rate_limit, mode)
                .context("invalid rate limit configuration")?,
        };

        let policy = PolicyEngine::new(config.policy.clone()).with_error_callback(|e| {
            warn!(error = %e, "policy rules unchanged after failed load");
        });

        let bus = match self.bus {
            Some(bus) => bus,
            None => connect_bus(&config.bus)
                .await
                .with_context(|| format!("connecting {} message bus", config.bus.backend.as_str()))?,
        };
        let router = Router::new(Arc::clone(&bus));

        let channels = ChannelRegistry::new();
        for (adapter, channel_config) in self.channels {
            channels.register(adapter, channel_config).await?;
        }

        info!(
            instance = %config.gateway.instance_id,
            mode = %mode,
            bus = bus.name(),
            audit = audit.provider_name().unwrap_or("disabled"),
            "gateway assembled"
        );

        Ok(Gateway::from_parts(Parts {
            config,
            sessions: Arc::new(SessionManager::new(Arc::clone(&state))),
            state,
            rate_limiter: Arc::new(rate_limiter),
            audit: Arc::new(audit),
            policy: Arc::new(policy),
            bus,
            router,
            channels: Arc::new(channels),
        }))
    }
}
