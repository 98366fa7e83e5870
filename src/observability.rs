//! Observability hooks for cache operations.
//!
//! Implement [`CacheMetrics`] to feed hits, loads, errors and invalidations
//! into your monitoring system:
//!
//! ```
//! use lazy_cache::observability::CacheMetrics;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct LoadCounter {
//!     loads: AtomicU64,
//! }
//!
//! impl CacheMetrics for LoadCounter {
//!     fn record_load(&self, _label: &str, _duration: Duration) {
//!         self.loads.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//! ```
//!
//! Methods that are not overridden fall back to logging through the `log`
//! crate. The default used by every cache is [`NoOpMetrics`].
//!
//! | Method | Called when |
//! |--------|-------------|
//! | `record_hit()` | A valid cached value was returned |
//! | `record_load()` | The loader ran and succeeded |
//! | `record_error()` | The loader failed |
//! | `record_invalidate()` | The value was explicitly invalidated |
//!
//! TTL expiry is not an invalidation; it shows up as a later `record_load`.

use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, label: &str) {
        trace!("Cache HIT: {}", label);
    }

    /// Record a successful load and how long the loader took.
    fn record_load(&self, label: &str, duration: Duration) {
        debug!("Cache LOAD: {} took {:?}", label, duration);
    }

    /// Record a failed load.
    fn record_error(&self, label: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", label, error);
    }

    /// Record an explicit invalidation.
    fn record_invalidate(&self, label: &str) {
        debug!("Cache INVALIDATE: {}", label);
    }
}

/// Metrics implementation that logs through the `log` crate.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _label: &str) {}
    fn record_load(&self, _label: &str, _duration: Duration) {}
    fn record_error(&self, _label: &str, _error: &str) {}
    fn record_invalidate(&self, _label: &str) {}
}
