use {tokio::sync::Mutex, tracing::warn};

use crate::event::AuditEvent;

/// Pending events shared by the batching providers.
///
/// A batch that failed to persist is put back in front of newer events.
/// The buffer never holds more than `max_pending`; the oldest events are
/// dropped first.
pub struct EventBuffer {
    events: Mutex<Vec<AuditEvent>>,
    batch_size: usize,
    max_pending: usize,
}

impl EventBuffer {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            events: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
            max_pending: batch_size.saturating_mul(10),
        }
    }

    /// Queue an event. Returns true once a full batch is waiting.
    pub async fn push(&self, event: AuditEvent) -> bool {
        let mut events = self.events.lock().await;
        events.push(event);
        Self::enforce_cap(&mut events, self.max_pending);
        events.len() >= self.batch_size
    }

    pub async fn take(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }

    pub async fn requeue(&self, mut batch: Vec<AuditEvent>) {
        let mut events = self.events.lock().await;
        batch.append(&mut events);
        *events = batch;
        Self::enforce_cap(&mut events, self.max_pending);
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn enforce_cap(events: &mut Vec<AuditEvent>, max: usize) {
        if events.len() > max {
            let dropped = events.len() - max;
            events.drain(..dropped);
            warn!(dropped, "audit buffer full, dropping oldest events");
        }
    }
}
