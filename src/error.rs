//! Error types for lazy values and the caches built on them.

use std::fmt;
use std::path::PathBuf;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by caller-supplied loaders.
///
/// Any error type converts into it with `?` or `.into()`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for the cache framework.
///
/// Load failures are never cached: a `get` that fails leaves the value empty,
/// so the next `get` retries the loader.
#[derive(Debug)]
pub enum Error {
    /// The loader returned an error.
    ///
    /// Wraps whatever the loader raised. The value stays unloaded.
    Load(BoxError),

    /// A TTL-producing loader returned a zero duration.
    InvalidTtl(String),

    /// A setter received an invalid argument, e.g. a zero TTL.
    ///
    /// This is a programming error at the call site.
    InvalidArgument(String),

    /// The watched path is not a regular file.
    NotARegularFile(PathBuf),

    /// The watched path could not be resolved or inspected.
    PathResolution {
        /// Path as given by the caller
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// A keyed cache operation failed for a specific key.
    Keyed {
        /// `Debug` rendering of the offending key
        key: String,
        /// The failure for that key
        source: Box<Error>,
    },

    /// The change-event source could not be set up or reported a failure.
    Watch(String),
}

impl Error {
    /// Wrap any error as a load failure.
    pub fn load<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Load(err.into())
    }

    /// Wrap this error with the key it occurred for.
    pub fn keyed<K: fmt::Debug>(key: &K, source: Error) -> Self {
        Error::Keyed {
            key: format!("{:?}", key),
            source: Box::new(source),
        }
    }

    /// Strip any `Keyed` wrappers and return the innermost error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Keyed { source, .. } => source.root(),
            other => other,
        }
    }

    /// True if this error (or the error it wraps for a key) is a load failure.
    pub fn is_load(&self) -> bool {
        matches!(self.root(), Error::Load(_))
    }

    /// True if this error (or the error it wraps for a key) is an invalid TTL.
    pub fn is_invalid_ttl(&self) -> bool {
        matches!(self.root(), Error::InvalidTtl(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Load(err) => write!(f, "Load error: {}", err),
            Error::InvalidTtl(msg) => write!(f, "Invalid TTL: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotARegularFile(path) => {
                write!(f, "Not a regular file: '{}'", path.display())
            }
            Error::PathResolution { path, source } => {
                write!(f, "Unable to resolve path '{}': {}", path.display(), source)
            }
            Error::Keyed { key, source } => write!(f, "Error for key {}: {}", key, source),
            Error::Watch(msg) => write!(f, "Watch error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Load(err) => Some(err.as_ref()),
            Error::PathResolution { source, .. } => Some(source),
            Error::Keyed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Load(Box::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Load(Box::new(e))
    }
}
