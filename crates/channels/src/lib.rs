//! Channel adapters.
//!
//! Each messaging platform implements [`ChannelAdapter`]. The gateway owns a
//! [`ChannelRegistry`] that starts and stops adapters and hands them the
//! envelopes published on their outbound topic.

pub mod adapter;
pub mod error;
pub mod message;
pub mod registry;

pub use {
    adapter::{ChannelAdapter, ChannelHealth},
    error::ChannelError,
    message::{InboundMessage, OutboundMessage, SendResult, Sender},
    registry::ChannelRegistry,
};
