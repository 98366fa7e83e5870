//! File-backed caches with automatic invalidation.
//!
//! A [`FileCache`] holds the contents of one file (raw bytes, or any type
//! decoded from them) in a [`LazyValue`](crate::LazyValue). A background tokio
//! task watches the file's directory and invalidates the value whenever the
//! file changes, so the next `get` reads it again.
//!
//! ```no_run
//! use lazy_cache::file::{FileCache, LogNotify, WatchConfig};
//! use serde::Deserialize;
//!
//! #[derive(Clone, Deserialize)]
//! struct Settings {
//!     name: String,
//! }
//!
//! # async fn run() -> lazy_cache::Result<()> {
//! let config = WatchConfig::default().with_log(LogNotify);
//! let settings: FileCache<Settings> = FileCache::json("settings.json", config)?;
//! println!("{}", settings.get()?.name);
//! # Ok(())
//! # }
//! ```
//!
//! To react to a change, register a hook with [`FileCache::on_invalidate`].
//! The watcher stops when the cache is dropped or [`FileCache::cancel`] is
//! called.

mod reader;
mod sink;
mod source;

pub use reader::FileCache;
pub use sink::{LogNotify, NoOpNotifyLog, NotifyLog};
pub use source::{ChangeEvent, ChangeEventSource, ChangeKind, PollWatcher, Subscription};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for file watching.
///
/// ```
/// use lazy_cache::file::{LogNotify, WatchConfig};
/// use std::time::Duration;
///
/// let config = WatchConfig::default()
///     .with_poll_interval(Duration::from_millis(250))
///     .with_log(LogNotify);
/// ```
#[derive(Clone)]
pub struct WatchConfig {
    /// How often [`PollWatcher`] checks the directory.
    pub poll_interval: Duration,

    /// Where watcher events and errors are reported.
    pub log: Arc<dyn NotifyLog>,

    /// Also hash file contents on every poll. Catches rewrites that keep
    /// both length and timestamps, at the cost of reading the directory's
    /// files each interval.
    pub compare_contents: bool,
}

impl WatchConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Enable or disable content hashing in [`PollWatcher`].
    pub fn with_compare_contents(mut self, compare_contents: bool) -> Self {
        self.compare_contents = compare_contents;
        self
    }

    /// Set the log sink.
    pub fn with_log(mut self, log: impl NotifyLog + 'static) -> Self {
        self.log = Arc::new(log);
        self
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            log: Arc::new(NoOpNotifyLog),
            compare_contents: false,
        }
    }
}

impl fmt::Debug for WatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchConfig")
            .field("poll_interval", &self.poll_interval)
            .field("compare_contents", &self.compare_contents)
            .finish_non_exhaustive()
    }
}
