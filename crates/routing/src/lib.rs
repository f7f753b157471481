//! Topic-based messaging between the gateway, channels, tools and the LLM
//! proxy.
//!
//! A [`MessageBus`] moves [`Envelope`]s between publishers and subscribers,
//! either inside the process or over NATS. The [`Router`] sits on top and
//! dispatches received envelopes to handlers registered by message type.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod router;
pub mod topics;

pub use {
    bus::{BusError, Handler, MessageBus, SubscriptionHandle, handler},
    config::{BusBackend, BusConfig, connect_bus},
    envelope::{Envelope, EnvelopeMeta, PublishMeta},
    memory::InProcessBus,
    router::Router,
};

#[cfg(feature = "nats")]
pub use nats::NatsBus;
