//! Geocode cache & adapter.
//!
//! [`GeocodeService`] fronts an external provider with a persistent
//! per-region cache, a minimum-interval request ceiling, and bounded retry
//! with backoff. Cache hits never touch the network; misses are resolved
//! once, recorded (found or not), and reused on every later run. A region
//! with many unresolvable addresses is a data-quality condition, not a
//! pipeline fault, so provider failure surfaces as "not found" rather than
//! an error.

mod cache;
mod provider;

pub use cache::{CacheEntry, GeocodeCache};
pub use provider::{GeocodeError, GeocodeProvider, HttpGeocoder};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::geometry::Coordinate;

/// Rate and retry policy for provider access.
#[derive(Debug, Clone)]
pub struct GeocodePolicy {
    /// Minimum interval between provider requests.
    pub min_interval: Duration,
    /// Retries after the first attempt, on transient failure only.
    pub max_retries: u32,
    /// Base backoff, doubled per retry.
    pub backoff: Duration,
}

impl Default for GeocodePolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1100),
            max_retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Per-run resolution counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeocodeStats {
    pub lookups: u64,
    pub cache_hits: u64,
    pub provider_calls: u64,
    pub not_found: u64,
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    cache_hits: AtomicU64,
    provider_calls: AtomicU64,
    not_found: AtomicU64,
}

/// Cache-fronted, rate-limited geocoding service.
pub struct GeocodeService {
    provider: Arc<dyn GeocodeProvider>,
    cache: GeocodeCache,
    policy: GeocodePolicy,
    last_request: Mutex<Option<Instant>>,
    counters: Counters,
}

impl GeocodeService {
    pub fn new(provider: Arc<dyn GeocodeProvider>, cache: GeocodeCache, policy: GeocodePolicy) -> Self {
        Self {
            provider,
            cache,
            policy,
            last_request: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Resolve a normalized address within a region. `None` means the address
    /// is unresolvable (provider said so, or it kept failing permanently).
    pub async fn resolve(
        &self,
        region: &str,
        query: &str,
    ) -> Result<Option<Coordinate>, StoreError> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.cache.get(region, query)? {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            if entry.coordinate.is_none() {
                self.counters.not_found.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(entry.coordinate);
        }

        let resolved = self.query_provider(region, query).await;
        if resolved.is_none() {
            self.counters.not_found.fetch_add(1, Ordering::Relaxed);
        }
        Ok(resolved)
    }

    /// Drop all cached entries for a region.
    pub fn invalidate_region(&self, region: &str) -> Result<usize, StoreError> {
        self.cache.invalidate_region(region)
    }

    pub fn stats(&self) -> GeocodeStats {
        GeocodeStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            provider_calls: self.counters.provider_calls.load(Ordering::Relaxed),
            not_found: self.counters.not_found.load(Ordering::Relaxed),
        }
    }

    async fn query_provider(&self, region: &str, query: &str) -> Option<Coordinate> {
        let mut attempt = 0u32;
        loop {
            self.throttle().await;
            self.counters.provider_calls.fetch_add(1, Ordering::Relaxed);

            match self.provider.lookup(query).await {
                Ok(result) => {
                    if let Err(e) = self.cache.put(region, query, result, self.provider.name()) {
                        warn!("failed to cache geocode result for {region}/{query:?}: {e}");
                    }
                    return result;
                }
                Err(GeocodeError::Permanent(reason)) => {
                    debug!("permanent geocode failure for {query:?}: {reason}");
                    if let Err(e) = self.cache.put(region, query, None, self.provider.name()) {
                        warn!("failed to cache geocode miss for {region}/{query:?}: {e}");
                    }
                    return None;
                }
                Err(GeocodeError::Transient(reason)) => {
                    if attempt >= self.policy.max_retries {
                        // Exhausted retries: give up for this run but leave
                        // the cache empty so a later run can try again.
                        warn!("geocode retries exhausted for {query:?}: {reason}");
                        return None;
                    }
                    let delay = self.policy.backoff * 2u32.saturating_pow(attempt);
                    debug!("transient geocode failure for {query:?} ({reason}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Enforce the minimum interval between provider requests.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.policy.min_interval {
                tokio::time::sleep(self.policy.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
