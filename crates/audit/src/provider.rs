use async_trait::async_trait;

use crate::{
    error::AuditError,
    event::{AuditEvent, AuditQuery},
};

/// A destination for audit events.
///
/// `log` may buffer; `flush` must persist everything buffered so far and
/// `close` must flush before releasing resources. Errors are returned as-is;
/// swallowing them is [`crate::AuditLogger`]'s job.
#[async_trait]
pub trait AuditProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare storage (directories, tables). Called once before use.
    async fn init(&self) -> Result<(), AuditError> {
        Ok(())
    }

    async fn log(&self, event: AuditEvent) -> Result<(), AuditError>;

    async fn flush(&self) -> Result<(), AuditError>;

    async fn close(&self) -> Result<(), AuditError> {
        self.flush().await
    }

    fn supports_query(&self) -> bool {
        false
    }

    async fn query(&self, _query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        Err(AuditError::QueryUnsupported(self.name().to_string()))
    }
}
