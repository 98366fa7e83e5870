//! Single-value lazy cache.
//!
//! [`LazyValue`] holds at most one instance of `T`, produced on demand by a
//! loader. Everything else in this crate is built on it.
//!
//! # Lifecycle
//!
//! ```text
//! EMPTY ──(load ok)──▶ VALID ──(TTL elapses)──▶ EMPTY
//!   ▲                    │
//!   └───(invalidate)─────┘
//! EMPTY ──(load error)──▶ EMPTY   (error returned, nothing cached)
//! ```
//!
//! # Example
//!
//! ```
//! use lazy_cache::LazyValue;
//! use std::time::Duration;
//!
//! let value = LazyValue::new(|| Ok("string".to_string()));
//! value.set_ttl(Duration::from_secs(30))?;
//!
//! assert_eq!(value.get()?, "string");
//! value.invalidate();
//! assert_eq!(value.get()?, "string");
//! # Ok::<(), lazy_cache::Error>(())
//! ```

use crate::error::{BoxError, Error, Result};
use crate::observability::{CacheMetrics, NoOpMetrics};
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Hook invoked synchronously on explicit invalidation.
pub type InvalidateFn = dyn Fn() + Send + Sync;

type PlainLoader<T> = dyn Fn() -> std::result::Result<T, BoxError> + Send + Sync;
type TtlLoader<T> = dyn Fn() -> std::result::Result<(T, Duration), BoxError> + Send + Sync;

enum Loader<T> {
    Plain(Box<PlainLoader<T>>),
    /// Loader that reports how long its value stays valid.
    WithTtl(Box<TtlLoader<T>>),
}

struct State<T> {
    current: Option<T>,
    ttl: Option<Duration>,
    // Only meaningful while `ttl` is set.
    expires_at: Option<Instant>,
    refresh_on_read: bool,
    on_invalidate: Option<Arc<InvalidateFn>>,
}

impl<T> State<T> {
    fn empty() -> Self {
        State {
            current: None,
            ttl: None,
            expires_at: None,
            refresh_on_read: false,
            on_invalidate: None,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        match (self.ttl, self.expires_at) {
            (None, _) => true,
            (Some(_), Some(deadline)) => now < deadline,
            (Some(_), None) => true,
        }
    }

    fn valid(&self, now: Instant) -> Option<&T> {
        self.current.as_ref().filter(|_| self.is_fresh(now))
    }
}

/// A concurrency-safe, lazily loaded value.
///
/// Reads share a reader-writer lock; a miss escalates to the exclusive lock
/// and re-checks before running the loader, so concurrent misses load once.
/// A failed load is returned to its caller only and nothing is cached.
///
/// The loader runs while the exclusive lock is held. It must not call back
/// into the same `LazyValue`.
pub struct LazyValue<T> {
    state: RwLock<State<T>>,
    loader: Loader<T>,
    label: Cow<'static, str>,
    metrics: Arc<dyn CacheMetrics>,
}

impl<T> LazyValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a lazily initialized value. Nothing is loaded until [`get`](Self::get).
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        Self::from_loader(Loader::Plain(Box::new(loader)))
    }

    /// Create a value and load it immediately.
    ///
    /// # Errors
    ///
    /// Returns the first load's error; no value is constructed in that case.
    pub fn new_eager<F>(loader: F) -> Result<Self>
    where
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let value = Self::new(loader);
        value.get()?;
        Ok(value)
    }

    /// Create a value that always reloads to the same constant.
    ///
    /// Invalidation still clears it; the next `get` repopulates it with `value`.
    pub fn fixed(value: T) -> Self {
        Self::new(move || Ok(value.clone()))
    }

    /// Create a value whose loader decides its own time to live.
    ///
    /// Useful for tokens and other values whose validity is only known once
    /// fetched. The loader's TTL replaces any TTL set with
    /// [`set_ttl`](Self::set_ttl) every time it runs. A zero TTL makes `get`
    /// fail with [`Error::InvalidTtl`].
    pub fn with_ttl_loader<F>(loader: F) -> Self
    where
        F: Fn() -> std::result::Result<(T, Duration), BoxError> + Send + Sync + 'static,
    {
        Self::from_loader(Loader::WithTtl(Box::new(loader)))
    }

    fn from_loader(loader: Loader<T>) -> Self {
        LazyValue {
            state: RwLock::new(State::empty()),
            loader,
            label: Cow::Borrowed("value"),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Set the label used in log lines and metrics.
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Label used in log lines and metrics.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Return the cached value, loading it if absent or expired.
    ///
    /// # Errors
    ///
    /// - `Error::Load`: the loader failed
    /// - `Error::InvalidTtl`: a TTL loader returned a zero duration
    ///
    /// In both cases the value stays empty and the next call retries.
    pub fn get(&self) -> Result<T> {
        let (hit, refresh) = {
            let state = self.read_state();
            let hit = state.valid(Instant::now()).cloned();
            let refresh = hit.is_some() && state.refresh_on_read && state.ttl.is_some();
            (hit, refresh)
        };

        if let Some(value) = hit {
            if refresh {
                self.refresh_deadline();
            }
            self.metrics.record_hit(&self.label);
            return Ok(value);
        }

        self.load()
    }

    fn refresh_deadline(&self) {
        let mut state = self.write_state();
        let now = Instant::now();
        // The value may have expired since the read lock was released.
        if state.valid(now).is_some() && state.refresh_on_read {
            if let Some(ttl) = state.ttl {
                state.expires_at = Some(now + ttl);
            }
        }
    }

    fn load(&self) -> Result<T> {
        let mut state = self.write_state();

        // Another caller may have loaded while we waited for the lock.
        if let Some(value) = state.valid(Instant::now()) {
            let value = value.clone();
            drop(state);
            self.metrics.record_hit(&self.label);
            return Ok(value);
        }

        if state.current.take().is_some() {
            debug!("{} expired, reloading", self.label);
        }
        state.expires_at = None;

        let started = Instant::now();
        let loaded = match &self.loader {
            Loader::Plain(load) => load().map_err(Error::Load),
            Loader::WithTtl(load) => match load() {
                Ok((_, ttl)) if ttl.is_zero() => Err(Error::InvalidTtl(format!(
                    "loader for {} returned a zero time to live",
                    self.label
                ))),
                Ok((value, ttl)) => {
                    state.ttl = Some(ttl);
                    Ok(value)
                }
                Err(err) => Err(Error::Load(err)),
            },
        };

        match loaded {
            Ok(value) => {
                let now = Instant::now();
                state.expires_at = state.ttl.map(|ttl| now + ttl);
                state.current = Some(value.clone());
                drop(state);
                self.metrics.record_load(&self.label, now - started);
                Ok(value)
            }
            Err(err) => {
                drop(state);
                self.metrics.record_error(&self.label, &err.to_string());
                Err(err)
            }
        }
    }

    /// Clear the cached value so the next `get` reloads it.
    ///
    /// Runs the [`on_invalidate`](Self::on_invalidate) hook, if any, before
    /// returning. TTL expiry never runs the hook.
    pub fn invalidate(&self) {
        let hook = {
            let mut state = self.write_state();
            state.current = None;
            state.expires_at = None;
            state.on_invalidate.clone()
        };
        self.metrics.record_invalidate(&self.label);
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Register a hook that runs whenever the value is explicitly invalidated.
    ///
    /// Replaces any previously registered hook.
    pub fn on_invalidate<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.write_state().on_invalidate = Some(Arc::new(hook));
    }

    /// Set how long a loaded value stays valid.
    ///
    /// The deadline is recomputed from now and read refresh is turned off.
    /// By default a value never expires.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `ttl` is zero.
    pub fn set_ttl(&self, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::InvalidArgument(
                "time to live must be greater than zero".to_string(),
            ));
        }
        let mut state = self.write_state();
        state.ttl = Some(ttl);
        state.expires_at = Some(Instant::now() + ttl);
        state.refresh_on_read = false;
        Ok(())
    }

    /// Remove the time to live. The held value, if any, is kept.
    pub fn remove_ttl(&self) {
        let mut state = self.write_state();
        state.ttl = None;
        state.expires_at = None;
    }

    /// Make every successful read push the expiry deadline forward by the TTL.
    ///
    /// Has no effect while no TTL is set. [`set_ttl`](Self::set_ttl) turns it
    /// off again.
    pub fn enable_read_refresh(&self) {
        self.write_state().refresh_on_read = true;
    }

    /// Current time to live, if any.
    pub fn ttl(&self) -> Option<Duration> {
        self.read_state().ttl
    }

    /// True if a value is held and has not expired.
    pub fn is_loaded(&self) -> bool {
        self.read_state().valid(Instant::now()).is_some()
    }

    // A loader that panics leaves `current` empty, so a poisoned lock still
    // guards consistent state.
    fn read_state(&self) -> RwLockReadGuard<'_, State<T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State<T>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for LazyValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("LazyValue")
            .field("label", &self.label)
            .field("loaded", &state.current.is_some())
            .field("ttl", &state.ttl)
            .finish()
    }
}
