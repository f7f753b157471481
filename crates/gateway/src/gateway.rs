use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use {
    nachos_audit::{AuditEvent, AuditLogger, AuditOutcome},
    nachos_channels::{ChannelRegistry, InboundMessage},
    nachos_config::NachosConfig,
    nachos_policy::{PolicyEngine, PolicyWatcher, SecurityRequest},
    nachos_ratelimit::{LimitType, RateLimiter, resolve_identity},
    nachos_routing::{
        Envelope, MessageBus, PublishMeta, Router, handler,
        router::{CHANNEL_INBOUND, LLM_REQUEST as LLM_REQUEST_TYPE, LLM_RESPONSE as LLM_RESPONSE_TYPE},
        topics,
    },
    nachos_sessions::{Message, NewMessage, Session, SessionError, SessionManager, StateStore},
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    health::{CheckStatus, HealthChecks, HealthReport},
    sandbox::{SandboxResult, SandboxRunner, SandboxTask, run_with_timeout},
};

/// Policy resource type for inbound traffic.
const CHANNEL_RESOURCE: &str = "channel";
/// Policy action checked before a message enters a session.
const SEND_ACTION: &str = "message.send";

const RATE_LIMITED_REPLY: &str = "You are sending messages too quickly. Please wait a moment.";
const DENIED_REPLY: &str = "This message was blocked by security policy.";

/// Session state after an inbound message was persisted.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub session: Session,
    pub message: Message,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboundOutcome {
    Accepted {
        session_id: String,
        correlation_id: String,
    },
    RateLimited {
        limit: Option<u32>,
        reset_at_ms: Option<u64>,
    },
    Denied {
        rule_id: Option<String>,
        reason: Option<String>,
    },
}

/// Payload expected on `nachos.llm.proxy.response`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmResponse {
    session_id: String,
    text: String,
    #[serde(default)]
    tool_calls: Option<Value>,
}

pub(crate) struct Parts {
    pub config: NachosConfig,
    pub state: Arc<dyn StateStore>,
    pub sessions: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLogger>,
    pub policy: Arc<PolicyEngine>,
    pub bus: Arc<dyn MessageBus>,
    pub router: Arc<Router>,
    pub channels: Arc<ChannelRegistry>,
}

pub struct Gateway {
    config: NachosConfig,
    state: Arc<dyn StateStore>,
    sessions: Arc<SessionManager>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLogger>,
    policy: Arc<PolicyEngine>,
    watcher: Mutex<Option<PolicyWatcher>>,
    bus: Arc<dyn MessageBus>,
    router: Arc<Router>,
    channels: Arc<ChannelRegistry>,
    started_at: Instant,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Gateway {
    pub(crate) fn from_parts(parts: Parts) -> Arc<Self> {
        Arc::new(Self {
            config: parts.config,
            state: parts.state,
            sessions: parts.sessions,
            rate_limiter: parts.rate_limiter,
            audit: parts.audit,
            policy: parts.policy,
            watcher: Mutex::new(None),
            bus: parts.bus,
            router: parts.router,
            channels: parts.channels,
            started_at: Instant::now(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn config(&self) -> &NachosConfig {
        &self.config
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Load policies, wire bus listeners and start channel adapters.
    /// Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.policy.is_enabled() {
            let policy = Arc::clone(&self.policy);
            if let Err(e) = tokio::task::spawn_blocking(move || policy.initialize()).await? {
                warn!(error = %e, "initial policy load failed, default effect applies");
            }
            if self.policy.config().watch {
                match PolicyWatcher::start(Arc::clone(&self.policy)) {
                    Ok(watcher) => *self.watcher.lock().await = Some(watcher),
                    Err(e) => warn!(error = %e, "policy hot reload unavailable"),
                }
            }
        } else {
            warn!("policy engine disabled, inbound messages are not authorized");
        }

        let gateway = Arc::downgrade(self);
        self.router
            .register(
                CHANNEL_INBOUND,
                handler(move |envelope| {
                    let gateway = gateway.clone();
                    async move {
                        if let Some(gateway) = gateway.upgrade() {
                            gateway.on_inbound_envelope(envelope).await;
                        }
                    }
                }),
            )
            .await;
        let gateway = Arc::downgrade(self);
        self.router
            .register(
                LLM_RESPONSE_TYPE,
                handler(move |envelope| {
                    let gateway = gateway.clone();
                    async move {
                        if let Some(gateway) = gateway.upgrade() {
                            gateway.on_llm_response(envelope).await;
                        }
                    }
                }),
            )
            .await;

        for channel in &self.config.gateway.channels {
            self.router.listen(&topics::channel_inbound(channel)).await?;
        }
        self.router.listen(topics::LLM_RESPONSE).await?;

        for id in self.channels.ids().await {
            let channels = Arc::clone(&self.channels);
            self.router
                .subscribe(
                    &topics::channel_outbound(&id),
                    handler(move |envelope: Envelope| {
                        let channels = Arc::clone(&channels);
                        async move {
                            match channels.deliver(&envelope).await {
                                Ok(result) if result.success => {
                                    debug!(topic = %envelope.topic, "outbound delivered");
                                },
                                Ok(result) => warn!(
                                    topic = %envelope.topic,
                                    error = result.error.as_deref().unwrap_or("unknown"),
                                    "channel rejected outbound message"
                                ),
                                Err(e) => warn!(topic = %envelope.topic, error = %e, "outbound delivery failed"),
                            }
                        }
                    }),
                )
                .await?;
        }

        let failed = self.channels.start_all().await.len();
        info!(
            instance = %self.config.gateway.instance_id,
            listening = self.config.gateway.channels.len(),
            channels_failed = failed,
            "gateway started"
        );
        Ok(())
    }

    /// Ordered drain: policy watcher, channels, router and bus, rate limiter
    /// stores, audit, state store. Every step runs even when an earlier one
    /// fails; the failures are reported together.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("gateway shutting down");
        let mut failures = Vec::new();

        let watcher = self.watcher.lock().await.take();
        if let Some(watcher) = watcher
            && let Err(e) = watcher.stop().await
        {
            warn!(error = %e, "policy watcher did not stop cleanly");
            failures.push(format!("policy watcher: {e}"));
        }

        for (id, e) in self.channels.stop_all().await {
            failures.push(format!("channel {id}: {e}"));
        }

        if let Err(e) = self.router.close().await {
            warn!(error = %e, "message bus did not close cleanly");
            failures.push(format!("message bus: {e}"));
        }

        self.rate_limiter.close().await;
        self.audit.close().await;
        self.state.close().await;

        if failures.is_empty() {
            info!("gateway stopped");
            Ok(())
        } else {
            anyhow::bail!("shutdown finished with errors: {}", failures.join("; "))
        }
    }

    // ── Message flow ────────────────────────────────────────────────────────

    /// Attach the message to its conversation's session and audit it. No
    /// rate limiting or policy checks happen here.
    pub async fn process_message(
        &self,
        inbound: &InboundMessage,
    ) -> anyhow::Result<ProcessedMessage> {
        let session = self.resolve_session(inbound).await?;
        let message = self
            .sessions
            .add_message(&session.id, NewMessage::user(inbound.text.clone()))
            .await?
            .ok_or_else(|| SessionError::Inactive {
                id: session.id.clone(),
                status: session.status,
            })?;

        let mut event = self
            .audit_event("message.received", "message.receive", AuditOutcome::Allowed)
            .with_user(inbound.sender.id.clone())
            .with_session(session.id.clone())
            .with_channel(inbound.channel.clone())
            .with_field("conversationId", inbound.conversation_id.clone());
        if let Some(id) = &inbound.message_id {
            event = event.with_field("messageId", id.clone());
        }
        self.audit.log(event).await;

        Ok(ProcessedMessage { session, message })
    }

    /// Full inbound pipeline: rate limit, policy, session, then hand-off to
    /// the LLM proxy topic. Denials are audited and answered on the channel.
    pub async fn handle_inbound(&self, inbound: &InboundMessage) -> anyhow::Result<InboundOutcome> {
        self.run_pipeline(inbound, None).await
    }

    async fn run_pipeline(
        &self,
        inbound: &InboundMessage,
        correlation_id: Option<String>,
    ) -> anyhow::Result<InboundOutcome> {
        let identity = resolve_identity(&serde_json::to_value(inbound)?)
            .unwrap_or_else(|| format!("{}:{}", inbound.channel, inbound.conversation_id));

        let limit = self.rate_limiter.check(&identity, LimitType::Message).await;
        if !limit.allowed {
            let event = self
                .audit_event("rate_limit.exceeded", SEND_ACTION, AuditOutcome::Denied)
                .with_user(inbound.sender.id.clone())
                .with_channel(inbound.channel.clone())
                .with_field("key", limit.key.clone())
                .with_field("limit", limit.limit);
            self.audit.log(event).await;
            self.reply(inbound, RATE_LIMITED_REPLY, correlation_id).await;
            return Ok(InboundOutcome::RateLimited {
                limit: limit.limit,
                reset_at_ms: limit.reset_at_ms,
            });
        }

        if self.policy.is_enabled() {
            let request = SecurityRequest::new(CHANNEL_RESOURCE, inbound.channel.clone(), SEND_ACTION)
                .with_user(inbound.sender.id.clone())
                .with_session(inbound.session_id.clone().unwrap_or_default())
                .with_mode(self.config.gateway.security_mode)
                .with_metadata(json!({
                    "conversationId": inbound.conversation_id,
                    "messageId": inbound.message_id,
                    "senderName": inbound.sender.name,
                    "textLength": inbound.text.chars().count(),
                }));
            let decision = self.policy.evaluate(&request);
            if !decision.allowed {
                let event = self
                    .audit_event("security.decision", SEND_ACTION, AuditOutcome::Denied)
                    .with_user(inbound.sender.id.clone())
                    .with_channel(inbound.channel.clone())
                    .with_field("ruleId", decision.rule_id.clone())
                    .with_field("reason", decision.reason.clone());
                self.audit.log(event).await;
                self.reply(
                    inbound,
                    decision.reason.as_deref().unwrap_or(DENIED_REPLY),
                    correlation_id,
                )
                .await;
                return Ok(InboundOutcome::Denied {
                    rule_id: decision.rule_id,
                    reason: decision.reason,
                });
            }
        }

        let processed = self.process_message(inbound).await?;
        let payload = json!({
            "sessionId": processed.session.id,
            "messageId": processed.message.id,
            "channel": inbound.channel,
            "conversationId": inbound.conversation_id,
            "sender": inbound.sender,
            "text": inbound.text,
            "systemPrompt": processed.session.system_prompt,
        });
        let meta = PublishMeta {
            message_type: Some(LLM_REQUEST_TYPE.into()),
            correlation_id,
        };
        let envelope = self.router.publish(topics::LLM_REQUEST, payload, meta).await?;

        Ok(InboundOutcome::Accepted {
            session_id: processed.session.id,
            correlation_id: envelope.meta.correlation_id,
        })
    }

    async fn resolve_session(&self, inbound: &InboundMessage) -> Result<Session, SessionError> {
        if let Some(id) = inbound.session_id.as_deref()
            && let Some(session) = self.sessions.get_session(id).await?
            && session.is_active()
            && session.channel == inbound.channel
        {
            return Ok(session);
        }
        self.sessions
            .get_or_create_session(&inbound.channel, &inbound.conversation_id, &inbound.sender.id)
            .await
    }

    async fn on_inbound_envelope(&self, envelope: Envelope) {
        let inbound: InboundMessage = match serde_json::from_value(envelope.payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "malformed inbound message");
                let event = self
                    .audit_event("message.invalid", "message.receive", AuditOutcome::Error)
                    .with_field("topic", envelope.topic)
                    .with_field("error", e.to_string());
                self.audit.log(event).await;
                return;
            },
        };
        if let Err(e) = self
            .run_pipeline(&inbound, Some(envelope.meta.correlation_id))
            .await
        {
            warn!(channel = %inbound.channel, error = %e, "inbound message failed");
            let event = self
                .audit_event("message.error", SEND_ACTION, AuditOutcome::Error)
                .with_user(inbound.sender.id.clone())
                .with_channel(inbound.channel.clone())
                .with_field("error", e.to_string());
            self.audit.log(event).await;
        }
    }

    /// Persist the assistant reply and forward it to the originating channel.
    async fn on_llm_response(&self, envelope: Envelope) {
        let correlation_id = envelope.meta.correlation_id.clone();
        let response: LlmResponse = match serde_json::from_value(envelope.payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "malformed LLM response");
                return;
            },
        };
        let session = match self.sessions.get_session(&response.session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(session_id = %response.session_id, "LLM response for unknown session");
                return;
            },
            Err(e) => {
                warn!(session_id = %response.session_id, error = %e, "session lookup failed");
                return;
            },
        };

        let mut message = NewMessage::assistant(response.text.clone());
        if let Some(tool_calls) = response.tool_calls {
            message = message.with_tool_calls(tool_calls);
        }
        if let Err(e) = self.sessions.add_message(&session.id, message).await {
            warn!(session_id = %session.id, error = %e, "failed to persist assistant message");
        }

        let payload = json!({
            "conversationId": session.conversation_id,
            "text": response.text,
        });
        let outcome = match self
            .router
            .send_to_channel(&session.channel, payload, Some(correlation_id))
            .await
        {
            Ok(_) => AuditOutcome::Allowed,
            Err(e) => {
                warn!(channel = %session.channel, error = %e, "failed to forward reply");
                AuditOutcome::Error
            },
        };
        let event = self
            .audit_event("message.sent", "message.send", outcome)
            .with_user(session.user_id.clone())
            .with_session(session.id.clone())
            .with_channel(session.channel.clone());
        self.audit.log(event).await;
    }

    async fn reply(&self, inbound: &InboundMessage, text: &str, correlation_id: Option<String>) {
        let payload = json!({
            "conversationId": inbound.conversation_id,
            "text": text,
            "replyTo": inbound.message_id,
        });
        if let Err(e) = self
            .router
            .send_to_channel(&inbound.channel, payload, correlation_id)
            .await
        {
            warn!(channel = %inbound.channel, error = %e, "failed to send denial reply");
        }
    }

    // ── Health and subagents ────────────────────────────────────────────────

    pub async fn get_health(&self) -> HealthReport {
        let database = self.state.health().await;
        if let Err(e) = &database {
            warn!(error = %e, "state store health check failed");
        }
        let bus = self.bus.health().await;
        if let Err(e) = &bus {
            warn!(error = %e, "message bus health check failed");
        }
        HealthReport::new(self.started_at.elapsed().as_secs(), HealthChecks {
            database: CheckStatus::from_result(&database),
            bus: CheckStatus::from_result(&bus),
        })
    }

    /// Run a subagent task under its timeout and audit the result.
    pub async fn run_subagent(&self, runner: &dyn SandboxRunner, task: SandboxTask) -> SandboxResult {
        let result = run_with_timeout(runner, &task, task.timeout()).await;
        let outcome = if result.success {
            AuditOutcome::Allowed
        } else {
            AuditOutcome::Error
        };
        let mut event = self
            .audit_event("subagent.run", "subagent.execute", outcome)
            .with_field("taskId", task.id.clone())
            .with_field("runner", runner.name())
            .with_field("durationMs", result.duration_ms)
            .with_field("sandboxed", result.sandboxed);
        if let Some(session_id) = &task.session_id {
            event = event.with_session(session_id.clone());
        }
        if let Some(error) = &result.error {
            event = event.with_field("error", error.clone());
        }
        self.audit.log(event).await;
        result
    }

    fn audit_event(&self, event_type: &str, action: &str, outcome: AuditOutcome) -> AuditEvent {
        AuditEvent::new(self.config.gateway.instance_id.clone(), event_type, action, outcome)
            .with_mode(self.config.gateway.security_mode)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use {
        super::*,
        crate::{builder::GatewayBuilder, sandbox::tests::EchoRunner},
        async_trait::async_trait,
        nachos_audit::{AuditError, AuditProvider},
        nachos_channels::{ChannelAdapter, ChannelError, ChannelHealth, OutboundMessage, SendResult},
        nachos_sessions::{SessionFilter, SqliteStateStore},
        tempfile::TempDir,
        tokio::sync::mpsc,
    };

    const RULES: &str = r#"
version: "1"
rules:
  - id: allow-slack
    priority: 100
    match: { resource: channel, action: message.send, resourceId: slack }
    effect: allow
  - id: deny-all
    priority: 1
    effect: deny
    reason: channel not allowed
"#;

    /// Config rooted in a scratch directory, two messages per minute.
    pub(crate) fn test_config(rules: Option<&str>) -> (NachosConfig, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        if let Some(rules) = rules {
            std::fs::write(dir.path().join("base.yaml"), rules).unwrap();
        }
        let mut config = NachosConfig::default();
        config.gateway.instance_id = "test-gw".into();
        config.gateway.channels = vec!["slack".into()];
        config.policy.policies_dir = dir.path().to_path_buf();
        config.rate_limit.overrides.messages_per_minute = Some(2);
        config.audit.enabled = false;
        (config, dir)
    }

    #[derive(Default)]
    struct RecordingAudit {
        events: StdMutex<Vec<AuditEvent>>,
    }

    impl RecordingAudit {
        fn of_type(&self, event_type: &str) -> Vec<AuditEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.event_type == event_type)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl AuditProvider for RecordingAudit {
        fn name(&self) -> &str {
            "recording"
        }

        async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        async fn flush(&self) -> Result<(), AuditError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: StdMutex<Vec<OutboundMessage>>,
        running: StdMutex<bool>,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn id(&self) -> &str {
            "slack"
        }

        async fn initialize(&self, _config: &Value) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn start(&self) -> Result<(), ChannelError> {
            *self.running.lock().unwrap() = true;
            Ok(())
        }

        async fn stop(&self) -> Result<(), ChannelError> {
            *self.running.lock().unwrap() = false;
            Ok(())
        }

        async fn send_message(&self, message: &OutboundMessage) -> SendResult {
            self.sent.lock().unwrap().push(message.clone());
            SendResult::sent(None)
        }

        async fn health_check(&self) -> ChannelHealth {
            ChannelHealth::ok()
        }
    }

    struct Harness {
        gateway: Arc<Gateway>,
        audit: Arc<RecordingAudit>,
        channel: Arc<RecordingChannel>,
        _dir: TempDir,
    }

    async fn harness(rules: Option<&str>) -> Harness {
        let (config, dir) = test_config(rules);
        let audit = Arc::new(RecordingAudit::default());
        let channel = Arc::new(RecordingChannel::default());
        let gateway = GatewayBuilder::new(config)
            .with_state_store(Arc::new(SqliteStateStore::in_memory().await.unwrap()))
            .with_audit_logger(AuditLogger::new(audit.clone()))
            .with_channel(channel.clone(), Value::Null)
            .build()
            .await
            .unwrap();
        Harness {
            gateway,
            audit,
            channel,
            _dir: dir,
        }
    }

    async fn collect(gateway: &Gateway, pattern: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        gateway
            .router()
            .subscribe(
                pattern,
                handler(move |env| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(env);
                    }
                }),
            )
            .await
            .unwrap();
        rx
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    fn message(channel: &str, sender: &str, text: &str) -> InboundMessage {
        InboundMessage::new(channel, "conv-1", sender, text)
    }

    #[tokio::test]
    async fn accepted_message_reaches_llm_topic() {
        let h = harness(Some(RULES)).await;
        h.gateway.policy().initialize().unwrap();
        let mut llm = collect(&h.gateway, topics::LLM_REQUEST).await;

        let outcome = h.gateway.handle_inbound(&message("slack", "u1", "hello")).await.unwrap();
        let (session_id, correlation_id) = match outcome {
            InboundOutcome::Accepted {
                session_id,
                correlation_id,
            } => (session_id, correlation_id),
            other => panic!("expected acceptance, got {other:?}"),
        };

        let env = recv(&mut llm).await;
        assert_eq!(env.meta.message_type, LLM_REQUEST_TYPE);
        assert_eq!(env.meta.correlation_id, correlation_id);
        assert_eq!(env.payload["sessionId"], session_id.as_str());
        assert_eq!(env.payload["text"], "hello");

        let history = h.gateway.sessions().get_messages(&session_id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        let received = h.audit.of_type("message.received");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(received[0].instance_id, "test-gw");
    }

    #[tokio::test]
    async fn policy_denial_is_audited_and_answered() {
        let h = harness(Some(RULES)).await;
        h.gateway.policy().initialize().unwrap();
        let mut replies = collect(&h.gateway, &topics::channel_outbound("discord")).await;

        let outcome = h.gateway.handle_inbound(&message("discord", "u1", "hi")).await.unwrap();
        assert_eq!(outcome, InboundOutcome::Denied {
            rule_id: Some("deny-all".into()),
            reason: Some("channel not allowed".into()),
        });

        let reply = recv(&mut replies).await;
        assert_eq!(reply.payload["text"], "channel not allowed");
        let denied = h.audit.of_type("security.decision");
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].outcome, AuditOutcome::Denied);
        assert!(
            h.gateway
                .sessions()
                .list_sessions(&SessionFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn third_message_in_window_is_rate_limited() {
        let h = harness(Some(RULES)).await;
        h.gateway.policy().initialize().unwrap();

        for _ in 0..2 {
            let outcome = h.gateway.handle_inbound(&message("slack", "u1", "spam")).await.unwrap();
            assert!(matches!(outcome, InboundOutcome::Accepted { .. }));
        }
        let outcome = h.gateway.handle_inbound(&message("slack", "u1", "spam")).await.unwrap();
        assert!(matches!(outcome, InboundOutcome::RateLimited { limit: Some(2), .. }));

        // Another sender has its own window.
        let other = h.gateway.handle_inbound(&message("slack", "u2", "hi")).await.unwrap();
        assert!(matches!(other, InboundOutcome::Accepted { .. }));

        assert_eq!(h.audit.of_type("rate_limit.exceeded").len(), 1);
        let session = h
            .gateway
            .sessions()
            .find_session("slack", "conv-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.gateway.sessions().message_count(&session.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn disabled_policy_skips_authorization() {
        let (mut config, _dir) = test_config(None);
        config.policy.enabled = false;
        let gateway = GatewayBuilder::new(config)
            .with_state_store(Arc::new(SqliteStateStore::in_memory().await.unwrap()))
            .build()
            .await
            .unwrap();
        let outcome = gateway.handle_inbound(&message("teams", "u1", "hi")).await.unwrap();
        assert!(matches!(outcome, InboundOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn process_message_reuses_the_conversation_session() {
        let h = harness(None).await;
        let first = h.gateway.process_message(&message("slack", "u1", "a")).await.unwrap();
        let second = h.gateway.process_message(&message("slack", "u1", "b")).await.unwrap();
        assert_eq!(first.session.id, second.session.id);

        // A session id from another channel is not trusted.
        let foreign = h.gateway.process_message(&message("discord", "u1", "c")).await.unwrap();
        let mut spoofed = message("slack", "u1", "d");
        spoofed.session_id = Some(foreign.session.id.clone());
        let resolved = h.gateway.process_message(&spoofed).await.unwrap();
        assert_eq!(resolved.session.id, first.session.id);
    }

    #[tokio::test]
    async fn started_gateway_routes_inbound_and_replies() {
        let h = harness(Some(RULES)).await;
        h.gateway.start().await.unwrap();
        let mut llm = collect(&h.gateway, topics::LLM_REQUEST).await;

        let inbound = serde_json::to_value(message("slack", "u1", "ping")).unwrap();
        h.gateway
            .bus()
            .publish(
                &topics::channel_inbound("slack"),
                inbound,
                PublishMeta::typed(CHANNEL_INBOUND).correlated("corr-7"),
            )
            .await
            .unwrap();

        let request = recv(&mut llm).await;
        assert_eq!(request.meta.correlation_id, "corr-7");
        let session_id = request.payload["sessionId"].as_str().unwrap().to_string();

        h.gateway
            .bus()
            .publish(
                topics::LLM_RESPONSE,
                json!({ "sessionId": session_id, "text": "pong" }),
                PublishMeta::typed(LLM_RESPONSE_TYPE).correlated("corr-7"),
            )
            .await
            .unwrap();

        let mut delivered = Vec::new();
        for _ in 0..200 {
            delivered = h.channel.sent.lock().unwrap().clone();
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "pong");
        assert_eq!(delivered[0].conversation_id, "conv-1");

        let history = h.gateway.sessions().get_messages(&session_id, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "pong");
    }

    #[tokio::test]
    async fn shutdown_drains_every_subsystem_once() {
        let h = harness(Some(RULES)).await;
        h.gateway.start().await.unwrap();
        assert!(*h.channel.running.lock().unwrap());
        assert!(h.gateway.get_health().await.is_healthy());

        h.gateway.shutdown().await.unwrap();
        assert!(!*h.channel.running.lock().unwrap());
        assert!(h.gateway.bus().health().await.is_err());
        assert!(!h.gateway.get_health().await.is_healthy());

        // Logging after close is dropped, not an error.
        h.gateway.audit().log(AuditEvent::new("x", "late", "late", AuditOutcome::Allowed)).await;
        assert!(h.audit.of_type("late").is_empty());
        h.gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn subagent_runs_are_audited() {
        let h = harness(None).await;
        let runner = EchoRunner {
            delay: Duration::ZERO,
        };

        let mut task = SandboxTask::new("summarize");
        task.session_id = Some("s-1".into());
        let ok = h.gateway.run_subagent(&runner, task).await;
        assert!(ok.success);

        let failed = h.gateway.run_subagent(&runner, SandboxTask::new("fail")).await;
        assert!(!failed.success);

        let events = h.audit.of_type("subagent.run");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Allowed);
        assert_eq!(events[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(events[1].outcome, AuditOutcome::Error);
        assert_eq!(events[1].extra["error"], "runner exploded");
    }
}
