//! Sliding-window admission control with a pluggable counter store.
//!
//! The limiter records every checked attempt in the store and compares the
//! resulting window count with the ceiling for the active security mode. A
//! failing primary store degrades to the in-process fallback instead of
//! blocking the request path.

pub mod config;
pub mod identity;
pub mod limiter;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use {
    config::{LimitOverrides, LimitType, RateLimitConfig, RateLimits},
    identity::resolve_identity,
    limiter::{RateLimitResult, RateLimiter, StoreSource},
    store::{MemoryRateLimitStore, RateLimitStore, RateLimitStoreError},
};

#[cfg(feature = "redis")]
pub use redis_store::RedisRateLimitStore;
