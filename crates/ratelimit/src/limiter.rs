use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {
    nachos_common::{SecurityMode, now_ms},
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    config::{LimitType, RateLimitConfig, RateLimits},
    store::{MemoryRateLimitStore, RateLimitStore, RateLimitStoreError},
};

/// Which store produced the count behind a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreSource {
    Primary,
    Fallback,
    /// No store consulted: limiter disabled, limit `0`, or every store failed.
    Unmetered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// `None` when unlimited.
    pub limit: Option<u32>,
    /// `None` when unlimited.
    pub remaining: Option<u64>,
    pub reset_at_ms: Option<u64>,
    pub source: StoreSource,
    pub key: String,
}

impl RateLimitResult {
    fn unmetered(key: String) -> Self {
        Self {
            allowed: true,
            limit: None,
            remaining: None,
            reset_at_ms: None,
            source: StoreSource::Unmetered,
            key,
        }
    }
}

/// Checks between sweeps of expired keys.
pub const DEFAULT_PRUNE_EVERY: u64 = 1_024;

pub struct RateLimiter {
    enabled: bool,
    window_ms: u64,
    limits: RateLimits,
    primary: Arc<dyn RateLimitStore>,
    fallback: Option<Arc<dyn RateLimitStore>>,
    prune_every: u64,
    checks: AtomicU64,
}

impl RateLimiter {
    /// Build from config. With a `redis_url` (and the `redis` feature) the
    /// shared store is primary and an in-process store is the fallback.
    pub fn new(config: &RateLimitConfig, mode: SecurityMode) -> Result<Self, RateLimitStoreError> {
        let memory: Arc<dyn RateLimitStore> = Arc::new(MemoryRateLimitStore::new());
        let (primary, fallback) = match config.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(url) => {
                let redis: Arc<dyn RateLimitStore> =
                    Arc::new(crate::redis_store::RedisRateLimitStore::new(url)?);
                (redis, Some(memory))
            },
            #[cfg(not(feature = "redis"))]
            Some(_) => {
                warn!("redis_url is set but the redis feature is disabled, using in-process counters");
                (memory, None)
            },
            None => (memory, None),
        };
        Ok(Self::with_stores(config, mode, primary, fallback))
    }

    pub fn with_stores(
        config: &RateLimitConfig,
        mode: SecurityMode,
        primary: Arc<dyn RateLimitStore>,
        fallback: Option<Arc<dyn RateLimitStore>>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            window_ms: config.window_ms.max(1),
            limits: RateLimits::for_mode(mode).with_overrides(&config.overrides),
            primary,
            fallback,
            prune_every: DEFAULT_PRUNE_EVERY,
            checks: AtomicU64::new(0),
        }
    }

    /// Sweep expired keys every `checks` metered checks. `0` disables it.
    pub fn with_prune_every(mut self, checks: u64) -> Self {
        self.prune_every = checks;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    pub async fn check(&self, identity: &str, limit_type: LimitType) -> RateLimitResult {
        self.check_at(identity, limit_type, now_ms()).await
    }

    /// Record one attempt at `now_ms` and decide. Denied attempts are
    /// recorded too.
    pub async fn check_at(
        &self,
        identity: &str,
        limit_type: LimitType,
        now_ms: u64,
    ) -> RateLimitResult {
        let key = format!("{limit_type}:{identity}");
        let limit = self.limits.limit_for(limit_type);
        if !self.enabled || limit == 0 {
            return RateLimitResult::unmetered(key);
        }

        let Some((count, source)) = self.record(&key, now_ms).await else {
            return RateLimitResult::unmetered(key);
        };

        self.maybe_prune(now_ms).await;

        let allowed = count <= u64::from(limit);
        if !allowed {
            debug!(key = %key, count, limit, "rate limit exceeded");
        }
        RateLimitResult {
            allowed,
            limit: Some(limit),
            remaining: Some(u64::from(limit).saturating_sub(count)),
            reset_at_ms: Some(now_ms + self.window_ms),
            source,
            key,
        }
    }

    async fn record(&self, key: &str, now_ms: u64) -> Option<(u64, StoreSource)> {
        let primary_err = match self.primary.record(key, now_ms, self.window_ms).await {
            Ok(count) => return Some((count, StoreSource::Primary)),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            warn!(store = self.primary.name(), error = %primary_err, "rate-limit store failed, allowing request");
            return None;
        };
        warn!(
            store = self.primary.name(),
            fallback = fallback.name(),
            error = %primary_err,
            "rate-limit store failed, using fallback"
        );
        match fallback.record(key, now_ms, self.window_ms).await {
            Ok(count) => Some((count, StoreSource::Fallback)),
            Err(e) => {
                warn!(store = fallback.name(), error = %e, "fallback rate-limit store failed, allowing request");
                None
            },
        }
    }

    async fn maybe_prune(&self, now_ms: u64) {
        if self.prune_every == 0 {
            return;
        }
        let n = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.prune_every == 0 {
            self.prune_at(now_ms).await;
        }
    }

    /// Drop expired keys from every store.
    pub async fn prune_at(&self, now_ms: u64) -> usize {
        let mut dropped = self.primary.prune(now_ms, self.window_ms).await;
        if let Some(fallback) = &self.fallback {
            dropped += fallback.prune(now_ms, self.window_ms).await;
        }
        if dropped > 0 {
            debug!(dropped, "pruned idle rate-limit keys");
        }
        dropped
    }

    /// Health of the primary store.
    pub async fn health(&self) -> Result<(), RateLimitStoreError> {
        self.primary.health().await
    }

    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(fallback) = &self.fallback {
            fallback.close().await;
        }
    }
}
