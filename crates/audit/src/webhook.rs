use std::{collections::HashMap, time::Duration};

use {
    async_trait::async_trait,
    reqwest::header::{HeaderMap, HeaderName, HeaderValue},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::{buffer::EventBuffer, error::AuditError, event::AuditEvent, provider::AuditProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookAuditConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for WebhookAuditConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            timeout_ms: 5_000,
            batch_size: 50,
        }
    }
}

/// POSTs batches as `{"events": [...]}`.
pub struct WebhookAuditProvider {
    client: reqwest::Client,
    url: String,
    buffer: EventBuffer,
}

#[derive(Serialize)]
struct Batch<'a> {
    events: &'a [AuditEvent],
}

impl WebhookAuditProvider {
    pub fn new(config: &WebhookAuditConfig) -> Result<Self, AuditError> {
        if config.url.trim().is_empty() {
            return Err(AuditError::config("webhook audit provider requires a url"));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AuditError::config(format!("invalid webhook header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| AuditError::config(format!("invalid value for webhook header {name}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            buffer: EventBuffer::new(config.batch_size),
        })
    }

    async fn post(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        self.client
            .post(&self.url)
            .json(&Batch { events })
            .send()
            .await?
            .error_for_status()?;
        debug!(count = events.len(), "audit batch delivered to webhook");
        Ok(())
    }
}

#[async_trait]
impl AuditProvider for WebhookAuditProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.buffer.push(event).await {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), AuditError> {
        let batch = self.buffer.take().await;
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.post(&batch).await {
            warn!(count = batch.len(), error = %e, "audit webhook delivery failed, requeueing batch");
            self.buffer.requeue(batch).await;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::event::AuditOutcome, mockito::Matcher, serde_json::json};

    fn event(action: &str) -> AuditEvent {
        AuditEvent::new("gw", "message.received", action, AuditOutcome::Allowed)
    }

    #[tokio::test]
    async fn posts_batch_with_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/audit")
            .match_header("x-api-key", "secret")
            .match_body(Matcher::PartialJson(json!({
                "events": [{"action": "a"}, {"action": "b"}]
            })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let provider = WebhookAuditProvider::new(&WebhookAuditConfig {
            url: format!("{}/audit", server.url()),
            headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
            batch_size: 2,
            ..Default::default()
        })
        .unwrap();
        provider.log(event("a")).await.unwrap();
        provider.log(event("b")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_keeps_batch() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/audit")
            .with_status(500)
            .create_async()
            .await;

        let provider = WebhookAuditProvider::new(&WebhookAuditConfig {
            url: format!("{}/audit", server.url()),
            batch_size: 10,
            ..Default::default()
        })
        .unwrap();
        provider.log(event("a")).await.unwrap();
        assert!(provider.flush().await.is_err());
        assert_eq!(provider.buffer.len().await, 1);
    }

    #[test]
    fn missing_url_is_configuration_error() {
        let err = WebhookAuditProvider::new(&WebhookAuditConfig::default()).err();
        assert!(matches!(err, Some(AuditError::Configuration(_))));
    }
}
