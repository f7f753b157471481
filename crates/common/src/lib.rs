//! Types shared by every gateway subsystem.

pub mod time;
pub mod types;

pub use {
    time::now_ms,
    types::{SecurityMode, UnknownSecurityMode},
};
