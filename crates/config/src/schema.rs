//! Root config schema. Each subsystem owns its section type; this module only
//! aggregates them and adds the gateway-level knobs.

use {
    nachos_audit::AuditConfig,
    nachos_common::SecurityMode,
    nachos_policy::PolicyEngineConfig,
    nachos_ratelimit::RateLimitConfig,
    nachos_routing::BusConfig,
    nachos_sessions::StateConfig,
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NachosConfig {
    pub gateway: GatewaySection,
    pub server: ServerConfig,
    pub state: StateConfig,
    pub policy: PolicyEngineConfig,
    pub rate_limit: RateLimitConfig,
    pub audit: AuditConfig,
    pub bus: BusConfig,
}

/// Identity and posture of this gateway instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Stamped on audit events; defaults to the host name.
    pub instance_id: String,
    pub security_mode: SecurityMode,
    /// Channel ids whose inbound topics the gateway listens on.
    pub channels: Vec<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let instance_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "nachos-gateway".into());
        Self {
            instance_id,
            security_mode: SecurityMode::default(),
            channels: Vec::new(),
        }
    }
}

/// Health endpoint listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
        }
    }
}
