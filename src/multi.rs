//! Keyed cache: one [`LazyValue`] per key.
//!
//! A [`KeyedCache`] behaves like a `LazyValue` addressed by a comparable key.
//! The per-key value is created on first access from a shared loader, and
//! dropped again on [`KeyedCache::invalidate`] so the next access starts
//! from a fresh value.
//!
//! ```
//! use lazy_cache::KeyedCache;
//! use std::time::Duration;
//!
//! let users = KeyedCache::new(|id: &u32| Ok(format!("user-{}", id)));
//! users.set_ttl_policy(Duration::from_secs(60))?;
//! users.preheat(&[1, 2, 3])?;
//!
//! assert_eq!(users.get(&2)?, "user-2");
//! assert_eq!(users.len(), 3);
//! # Ok::<(), lazy_cache::Error>(())
//! ```
//!
//! A `KeyedCache` can hold other caches (wrapped in `Arc`) when values need
//! a logical grouping.

use crate::error::{BoxError, Error, Result};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::value::LazyValue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

type PlainKeyLoader<K, T> = dyn Fn(&K) -> std::result::Result<T, BoxError> + Send + Sync;
type TtlKeyLoader<K, T> = dyn Fn(&K) -> std::result::Result<(T, Duration), BoxError> + Send + Sync;

enum KeyLoader<K, T> {
    Plain(Arc<PlainKeyLoader<K, T>>),
    WithTtl(Arc<TtlKeyLoader<K, T>>),
}

/// Caches many values of type `T` by key `K`.
///
/// Entries live in a sharded [`DashMap`]. A miss creates the entry through
/// the map's entry API, so concurrent misses on one key agree on a single
/// `LazyValue`. Map guards are released before any loader runs, so loaders
/// for different keys run in parallel.
pub struct KeyedCache<K, T>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Arc<LazyValue<T>>>,
    loader: KeyLoader<K, T>,
    ttl_policy: RwLock<Option<Duration>>,
    metrics: Arc<dyn CacheMetrics>,
}

impl<K, T> KeyedCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create a new keyed cache with the given per-key loader.
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&K) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        Self::from_loader(KeyLoader::Plain(Arc::new(loader)))
    }

    /// Create a keyed cache whose loader reports a time to live per key.
    ///
    /// A TTL policy set with [`set_ttl_policy`](Self::set_ttl_policy) takes
    /// precedence over the loader's TTL for entries created after it.
    pub fn with_ttl_loader<F>(loader: F) -> Self
    where
        F: Fn(&K) -> std::result::Result<(T, Duration), BoxError> + Send + Sync + 'static,
    {
        Self::from_loader(KeyLoader::WithTtl(Arc::new(loader)))
    }

    fn from_loader(loader: KeyLoader<K, T>) -> Self {
        KeyedCache {
            entries: DashMap::new(),
            loader,
            ttl_policy: RwLock::new(None),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Set custom metrics handler, shared by every entry created afterwards.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Return the value for `key`, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Keyed` naming `key` and wrapping the `LazyValue` error
    /// (`Error::Load` or `Error::InvalidTtl`).
    pub fn get(&self, key: &K) -> Result<T> {
        self.entry(key)
            .get()
            .map_err(|err| Error::keyed(key, err))
    }

    /// Load the value for each key in order.
    ///
    /// Stops at the first error and returns it. Duplicate keys load once.
    pub fn preheat(&self, keys: &[K]) -> Result<()> {
        for key in keys {
            self.get(key)?;
        }
        debug!("Preheated {} keys", keys.len());
        Ok(())
    }

    /// Invalidate the value for `key` and drop it from the cache.
    ///
    /// The next `get` creates a fresh value, so any TTL state of the old
    /// entry is discarded. No-op if the key has no entry.
    pub fn invalidate(&self, key: &K) {
        if let Some((_, value)) = self.entries.remove(key) {
            value.invalidate();
        }
    }

    /// Attach an invalidation hook to the current entry for `key`.
    ///
    /// No-op if the key has no entry yet.
    pub fn on_invalidate<F>(&self, key: &K, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let value = self.entries.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(value) = value {
            value.on_invalidate(hook);
        }
    }

    /// Set the time to live applied to every entry created from now on.
    ///
    /// Existing entries keep their TTL. The policy takes precedence over a
    /// TTL reported by the loader. By default entries never expire.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `ttl` is zero.
    pub fn set_ttl_policy(&self, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::InvalidArgument(
                "time to live policy must be greater than zero".to_string(),
            ));
        }
        *self
            .ttl_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(ttl);
        Ok(())
    }

    /// Current TTL policy, if any.
    pub fn ttl_policy(&self) -> Option<Duration> {
        *self.ttl_policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with an entry (loaded or not).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no key has an entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `key` has an entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn entry(&self, key: &K) -> Arc<LazyValue<T>> {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }

        // Re-checked under the shard's write lock; first insert wins.
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let value = Arc::new(self.create(key));
                entry.insert(Arc::clone(&value));
                trace!("Created entry for key {:?}", key);
                value
            }
        }
    }

    fn create(&self, key: &K) -> LazyValue<T> {
        let policy = self.ttl_policy();
        let owned = key.clone();
        let value = match (&self.loader, policy) {
            (KeyLoader::Plain(load), _) => {
                let load = Arc::clone(load);
                LazyValue::new(move || load(&owned))
            }
            (KeyLoader::WithTtl(load), Some(_)) => {
                let load = Arc::clone(load);
                LazyValue::new(move || load(&owned).map(|(value, _)| value))
            }
            (KeyLoader::WithTtl(load), None) => {
                let load = Arc::clone(load);
                LazyValue::with_ttl_loader(move || load(&owned))
            }
        };
        let value = value
            .with_label(format!("{:?}", key))
            .with_metrics(Arc::clone(&self.metrics));

        if let Some(ttl) = policy {
            // The policy was validated as non-zero when it was set.
            if let Err(err) = value.set_ttl(ttl) {
                warn!("Ignoring TTL policy for key {:?}: {}", key, err);
            }
        }
        value
    }
}

impl<K, T> fmt::Debug for KeyedCache<K, T>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}
