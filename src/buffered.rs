//! Double-buffered keyed cache.
//!
//! [`BufferedKeyedCache`] keeps a read cache and a write buffer. Writers store
//! into a per-key [`WriteCell`] and invalidate the matching read entry;
//! readers only touch the read cache and fall through to the cell on a miss.
//! With good hit rates readers and writers barely contend, at the cost of one
//! extra cell per key.
//!
//! ```
//! use lazy_cache::BufferedKeyedCache;
//!
//! let flags: BufferedKeyedCache<&str, bool> = BufferedKeyedCache::new();
//! assert!(!flags.get(&"beta")?);
//!
//! flags.set(&"beta", true);
//! assert!(flags.get(&"beta")?);
//!
//! flags.unset(&"beta");
//! assert!(!flags.get(&"beta")?);
//! # Ok::<(), lazy_cache::Error>(())
//! ```

use crate::error::Result;
use crate::multi::KeyedCache;
use crate::observability::CacheMetrics;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// A typed, independently locked slot holding the latest written value.
#[derive(Debug, Default)]
pub struct WriteCell<T> {
    value: RwLock<T>,
}

impl<T: Clone> WriteCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        WriteCell {
            value: RwLock::new(value),
        }
    }

    /// Current value.
    pub fn load(&self) -> T {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current value.
    pub fn store(&self, value: T) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// Keyed cache with separate write and read paths.
pub struct BufferedKeyedCache<K, T>
where
    K: Eq + Hash,
{
    read_cache: KeyedCache<K, T>,
    // Cells are created on first write; a key without one reads as default.
    write_buffer: Arc<DashMap<K, Arc<WriteCell<T>>>>,
}

impl<K, T> BufferedKeyedCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Default + Send + Sync + 'static,
{
    /// Create an empty buffered cache. Keys that were never set read as `T::default()`.
    pub fn new() -> Self {
        let write_buffer: Arc<DashMap<K, Arc<WriteCell<T>>>> = Arc::new(DashMap::new());

        let buffer = Arc::clone(&write_buffer);
        let read_cache = KeyedCache::new(move |key: &K| {
            let cell = buffer.get(key).map(|cell| Arc::clone(cell.value()));
            Ok(cell.map(|cell| cell.load()).unwrap_or_default())
        });

        BufferedKeyedCache {
            read_cache,
            write_buffer,
        }
    }

    /// Set custom metrics handler for the read cache.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.read_cache = self.read_cache.with_metrics(metrics);
        self
    }

    /// Return the value for `key` from the read cache.
    ///
    /// A miss reads the key's write cell.
    ///
    /// # Errors
    ///
    /// Returns `Error::Keyed` naming `key` if loading from the buffer fails.
    pub fn get(&self, key: &K) -> Result<T> {
        self.read_cache.get(key)
    }

    /// Store `value` for `key` and invalidate its read entry.
    ///
    /// Any `get` that starts after this returns sees `value` or a value from a
    /// concurrent `set`.
    pub fn set(&self, key: &K, value: T) {
        self.cell(key).store(value);
        self.read_cache.invalidate(key);
    }

    /// Clear `key` from both the write buffer and the read cache.
    ///
    /// The next `get` returns `T::default()`.
    pub fn unset(&self, key: &K) {
        self.write_buffer.remove(key);
        self.read_cache.invalidate(key);
    }

    /// Load each key into the read cache, stopping at the first error.
    pub fn preheat(&self, keys: &[K]) -> Result<()> {
        self.read_cache.preheat(keys)
    }

    /// Invalidate the read entry for `key`. The written value is kept.
    pub fn invalidate(&self, key: &K) {
        self.read_cache.invalidate(key);
    }

    /// Attach an invalidation hook to the read entry for `key`.
    ///
    /// No-op if the key has no read entry yet.
    pub fn on_invalidate<F>(&self, key: &K, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.read_cache.on_invalidate(key, hook);
    }

    /// Set the TTL policy for read entries created from now on.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `ttl` is zero.
    pub fn set_ttl_policy(&self, ttl: Duration) -> Result<()> {
        self.read_cache.set_ttl_policy(ttl)
    }

    fn cell(&self, key: &K) -> Arc<WriteCell<T>> {
        if let Some(cell) = self.write_buffer.get(key) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.write_buffer.entry(key.clone()).or_default().value())
    }
}

impl<K, T> Default for BufferedKeyedCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> fmt::Debug for BufferedKeyedCache<K, T>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedKeyedCache")
            .field("read_cache", &self.read_cache)
            .field("written_keys", &self.write_buffer.len())
            .finish()
    }
}
