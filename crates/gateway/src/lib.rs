//! Gateway: composition root for the security and orchestration kernel.
//!
//! Lifecycle:
//! 1. Build from config (state store, audit, rate limiter, policy engine, bus)
//! 2. `start()`: first policy load, watcher, inbound listeners, channel start
//! 3. Serve `/health`
//! 4. `shutdown()`: ordered drain of every subsystem
//!
//! The inbound pipeline is rate limit → policy → session → LLM proxy topic.

pub mod builder;
pub mod gateway;
pub mod health;
pub mod sandbox;
pub mod server;

pub use {
    builder::GatewayBuilder,
    gateway::{Gateway, InboundOutcome, ProcessedMessage},
    health::{CheckStatus, HealthChecks, HealthReport, HealthStatus},
    nachos_config::NachosConfig as GatewayConfig,
    sandbox::{SandboxResult, SandboxRunner, SandboxTask, run_with_timeout},
    server::{build_app, serve},
};
