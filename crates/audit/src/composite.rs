use std::sync::Arc;

use {async_trait::async_trait, futures::future::join_all, tracing::warn};

use crate::{
    error::AuditError,
    event::{AuditEvent, AuditQuery},
    provider::AuditProvider,
};

/// Fans every call out to its children concurrently.
///
/// A failing child is logged and skipped. The call only fails when every
/// child failed.
pub struct CompositeAuditProvider {
    providers: Vec<Arc<dyn AuditProvider>>,
}

impl CompositeAuditProvider {
    pub fn new(providers: Vec<Arc<dyn AuditProvider>>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &[Arc<dyn AuditProvider>] {
        &self.providers
    }

    fn collect(&self, op: &str, results: Vec<Result<(), AuditError>>) -> Result<(), AuditError> {
        let mut failed = Vec::new();
        for (provider, result) in self.providers.iter().zip(results) {
            if let Err(e) = result {
                warn!(provider = provider.name(), op, error = %e, "audit sub-provider failed");
                failed.push(provider.name().to_string());
            }
        }
        if !failed.is_empty() && failed.len() == self.providers.len() {
            return Err(AuditError::Provider {
                provider: "composite".into(),
                message: format!("{op} failed for every provider: {}", failed.join(", ")),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AuditProvider for CompositeAuditProvider {
    fn name(&self) -> &str {
        "composite"
    }

    async fn init(&self) -> Result<(), AuditError> {
        let results = join_all(self.providers.iter().map(|p| p.init())).await;
        self.collect("init", results)
    }

    async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        let results = join_all(self.providers.iter().map(|p| p.log(event.clone()))).await;
        self.collect("log", results)
    }

    async fn flush(&self) -> Result<(), AuditError> {
        let results = join_all(self.providers.iter().map(|p| p.flush())).await;
        self.collect("flush", results)
    }

    async fn close(&self) -> Result<(), AuditError> {
        let results = join_all(self.providers.iter().map(|p| p.close())).await;
        self.collect("close", results)
    }

    fn supports_query(&self) -> bool {
        self.providers.iter().any(|p| p.supports_query())
    }

    /// Served by the first child that can answer queries.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        match self.providers.iter().find(|p| p.supports_query()) {
            Some(provider) => provider.query(query).await,
            None => Err(AuditError::QueryUnsupported(self.name().to_string())),
        }
    }
}
