//! Best-effort audit trail.
//!
//! Providers persist [`AuditEvent`]s (NDJSON files, SQLite, webhooks, a
//! fan-out composite, or user-registered factories). [`AuditLogger`] wraps one
//! provider and turns every provider failure into a log line so audit problems
//! never reach the caller.

pub mod buffer;
pub mod composite;
pub mod error;
pub mod event;
pub mod factory;
pub mod file;
pub mod logger;
pub mod provider;
pub mod sqlite;
pub mod webhook;

pub use {
    composite::CompositeAuditProvider,
    error::AuditError,
    event::{AuditEvent, AuditOutcome, AuditQuery},
    factory::{
        AuditConfig, AuditProviderKind, AuditProviderRegistry, CompositeAuditConfig,
        CustomAuditConfig, ProviderFactory, create_provider, validate_config,
    },
    file::{FileAuditConfig, FileAuditProvider},
    logger::AuditLogger,
    provider::AuditProvider,
    sqlite::{SqliteAuditConfig, SqliteAuditProvider},
    webhook::{WebhookAuditConfig, WebhookAuditProvider},
};
