use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    error::AuditError,
    event::{AuditEvent, AuditQuery},
    factory::{AuditConfig, AuditProviderRegistry, create_provider},
    provider::AuditProvider,
};

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Front door for audit events.
///
/// Never returns provider errors from `log`, `flush` or `close`; they are
/// logged at `warn` and dropped. A disabled logger accepts and discards
/// everything.
pub struct AuditLogger {
    provider: Option<Arc<dyn AuditProvider>>,
    ticker: Mutex<Option<Ticker>>,
    closed: AtomicBool,
}

impl AuditLogger {
    pub fn new(provider: Arc<dyn AuditProvider>) -> Self {
        Self {
            provider: Some(provider),
            ticker: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn disabled() -> Self {
        Self {
            provider: None,
            ticker: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Build the configured provider, initialize it and start the periodic
    /// flush. Only configuration errors are returned; an `init` failure is
    /// logged and the logger keeps trying on later calls.
    pub async fn from_config(
        config: &AuditConfig,
        registry: &AuditProviderRegistry,
    ) -> Result<Self, AuditError> {
        if !config.enabled {
            debug!("audit logging disabled");
            return Ok(Self::disabled());
        }
        let provider = create_provider(config, registry).await?;
        if let Err(e) = provider.init().await {
            warn!(provider = provider.name(), error = %e, "audit provider init failed");
        }
        let logger = Self::new(provider);
        logger
            .start_flush_ticker(Duration::from_millis(config.flush_interval_ms))
            .await;
        Ok(logger)
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_deref().map(|p| p.name())
    }

    /// Flush on a fixed interval until [`Self::close`]. No-op outside a
    /// tokio runtime or for a zero interval.
    pub async fn start_flush_ticker(&self, interval: Duration) {
        let Some(provider) = self.provider.clone() else {
            return;
        };
        if interval.is_zero() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = provider.flush().await {
                            warn!(provider = provider.name(), error = %e, "periodic audit flush failed");
                        }
                    },
                }
            }
        });

        if let Some(previous) = self.ticker.lock().await.replace(Ticker { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    pub async fn log(&self, event: AuditEvent) {
        let Some(provider) = &self.provider else {
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            debug!(event_type = %event.event_type, "audit logger closed, dropping event");
            return;
        }
        if let Err(e) = provider.log(event).await {
            warn!(provider = provider.name(), error = %e, "audit log failed");
        }
    }

    pub async fn flush(&self) {
        if let Some(provider) = &self.provider
            && let Err(e) = provider.flush().await
        {
            warn!(provider = provider.name(), error = %e, "audit flush failed");
        }
    }

    /// Read events back when the provider supports it. Unlike writes, query
    /// errors are returned.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        match &self.provider {
            Some(provider) => provider.query(query).await,
            None => Ok(Vec::new()),
        }
    }

    /// Stop the ticker, flush and release the provider. Safe to call twice.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.cancel.cancel();
            if let Err(e) = ticker.handle.await {
                warn!(error = %e, "audit flush task ended abnormally");
            }
        }
        if let Some(provider) = &self.provider
            && let Err(e) = provider.close().await
        {
            warn!(provider = provider.name(), error = %e, "audit close failed");
        }
    }
}
