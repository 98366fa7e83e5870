//! # lazy-cache
//!
//! Concurrency-safe lazy values with TTL and invalidation hooks, and the
//! caches built on them.
//!
//! ## Features
//!
//! - **Lazy or eager:** Values load on first `get`, or at construction
//! - **Time to live:** Fixed, loader-supplied, or refreshed on every read
//! - **Invalidation hooks:** React when a value is explicitly discarded
//! - **Keyed caches:** One lazy value per key, with a shared TTL policy
//! - **Double buffering:** Separate write and read paths for hot keys
//! - **File caches:** File contents invalidated when the file changes (`file` feature)
//!
//! ## Quick Start
//!
//! ```
//! use lazy_cache::{KeyedCache, LazyValue};
//! use std::time::Duration;
//!
//! // A single value, reloaded every 30 seconds
//! let token = LazyValue::new(|| Ok("secret".to_string()));
//! token.set_ttl(Duration::from_secs(30))?;
//! assert_eq!(token.get()?, "secret");
//!
//! // Many values by key
//! let squares = KeyedCache::new(|n: &u64| Ok(n * n));
//! assert_eq!(squares.get(&12)?, 144);
//! # Ok::<(), lazy_cache::Error>(())
//! ```
//!
//! Loaders return `Result<T, BoxError>`, so any error type can be raised
//! with `?`. A failed load is returned to the caller and never cached.

#[macro_use]
extern crate log;

pub mod buffered;
pub mod error;
#[cfg(feature = "file")]
pub mod file;
pub mod multi;
pub mod observability;
pub mod value;

// Re-exports for convenience
pub use buffered::{BufferedKeyedCache, WriteCell};
pub use error::{BoxError, Error, Result};
#[cfg(feature = "file")]
pub use file::FileCache;
pub use multi::KeyedCache;
pub use observability::CacheMetrics;
pub use value::LazyValue;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
