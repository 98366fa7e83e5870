//! File cache constructors and the watcher task.

use super::sink::NotifyLog;
use super::source::{ChangeEventSource, PollWatcher, Subscription};
use super::WatchConfig;
use crate::error::{BoxError, Error, Result};
use crate::value::LazyValue;
use serde::de::DeserializeOwned;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A cached, decoded view of one file, invalidated when the file changes.
///
/// The value is lazy: nothing is read until the first [`get`](Self::get).
/// The watcher task runs until [`cancel`](Self::cancel) is called or the
/// cache is dropped. Cancelling does not clear the cached value.
pub struct FileCache<T> {
    path: PathBuf,
    value: Arc<LazyValue<T>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<T> FileCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Cache whatever `read` decodes from the file at `path`.
    ///
    /// Changes are detected with a [`PollWatcher`] using the configured
    /// interval. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `Error::PathResolution`: `path` cannot be resolved or inspected
    /// - `Error::NotARegularFile`: `path` is a directory
    /// - `Error::Watch`: the directory cannot be watched
    pub fn reader<F>(path: impl AsRef<Path>, read: F, config: WatchConfig) -> Result<Self>
    where
        F: Fn(&mut dyn Read) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let source =
            PollWatcher::new(config.poll_interval).with_compare_contents(config.compare_contents);
        Self::with_source(path, read, &source, config.log)
    }

    /// Like [`reader`](Self::reader), with a caller-supplied change-event source.
    pub fn with_source<F, S>(
        path: impl AsRef<Path>,
        read: F,
        source: &S,
        log: Arc<dyn NotifyLog>,
    ) -> Result<Self>
    where
        F: Fn(&mut dyn Read) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
        S: ChangeEventSource + ?Sized,
    {
        let path = resolve_file(path.as_ref())?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NotARegularFile(path.clone()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| Error::Watch(format!("no tokio runtime for the watcher: {}", err)))?;

        let loader_path = path.clone();
        let value = Arc::new(
            LazyValue::new(move || {
                let mut file = File::open(&loader_path).map_err(|err| {
                    format!(
                        "failed to open file '{}' for reading: {}",
                        loader_path.display(),
                        err
                    )
                })?;
                let reader: &mut dyn Read = &mut file;
                read(reader).map_err(|err| {
                    format!(
                        "failed to read file '{}' contents: {}",
                        loader_path.display(),
                        err
                    )
                    .into()
                })
            })
            .with_label(path.display().to_string()),
        );

        let subscription = source.subscribe(&dir)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(watch_file(
            path.clone(),
            Arc::clone(&value),
            subscription,
            log,
            shutdown_rx,
        ));
        debug!("Watching '{}' for changes", path.display());

        Ok(FileCache {
            path,
            value,
            shutdown,
            task,
        })
    }

    /// Return the decoded contents, reading the file if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Load` if the file cannot be opened or decoded. The
    /// watcher keeps running; the next `get` tries again.
    pub fn get(&self) -> Result<T> {
        self.value.get()
    }

    /// Drop the cached contents so the next `get` reads the file again.
    pub fn invalidate(&self) {
        self.value.invalidate();
    }

    /// Register a hook that runs whenever the contents are invalidated,
    /// either by a file change or by [`invalidate`](Self::invalidate).
    pub fn on_invalidate<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.value.on_invalidate(hook);
    }

    /// The underlying lazy value, e.g. to set a TTL.
    pub fn value(&self) -> &Arc<LazyValue<T>> {
        &self.value
    }

    /// Canonical path of the watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the watcher task. The cached value is left as it is.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// True while the watcher task is running.
    pub fn is_watching(&self) -> bool {
        !self.task.is_finished()
    }
}

impl FileCache<Vec<u8>> {
    /// Cache the raw bytes of the file at `path`.
    pub fn bytes(path: impl AsRef<Path>, config: WatchConfig) -> Result<Self> {
        Self::reader(
            path,
            |reader| {
                let mut contents = Vec::new();
                reader.read_to_end(&mut contents)?;
                Ok(contents)
            },
            config,
        )
    }

    /// Like [`bytes`](Self::bytes), but reads the file before returning.
    pub fn eager_bytes(path: impl AsRef<Path>, config: WatchConfig) -> Result<Self> {
        let cache = Self::bytes(path, config)?;
        cache.get()?;
        Ok(cache)
    }
}

impl<T> FileCache<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Cache the file at `path` decoded as JSON.
    pub fn json(path: impl AsRef<Path>, config: WatchConfig) -> Result<Self> {
        Self::reader(
            path,
            |reader| serde_json::from_reader(reader).map_err(BoxError::from),
            config,
        )
    }
}

impl<T> Drop for FileCache<T> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl<T> fmt::Debug for FileCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCache")
            .field("path", &self.path)
            .field("watching", &!self.task.is_finished())
            .finish()
    }
}

fn resolve_file(path: &Path) -> Result<PathBuf> {
    let canonical = std::fs::canonicalize(path).map_err(|source| Error::PathResolution {
        path: path.to_path_buf(),
        source,
    })?;
    let metadata = std::fs::metadata(&canonical).map_err(|source| Error::PathResolution {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_file() {
        return Err(Error::NotARegularFile(canonical));
    }
    Ok(canonical)
}

async fn watch_file<T>(
    path: PathBuf,
    value: Arc<LazyValue<T>>,
    mut subscription: Subscription,
    log: Arc<dyn NotifyLog>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: Clone + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = subscription.events.recv() => match event {
                Some(event) if event.path == path => {
                    log.event(&event);
                    // Any kind of change may need a reload. Invalidation waits
                    // for an in-flight load, so keep it off the runtime threads.
                    let value = Arc::clone(&value);
                    let invalidated = tokio::task::spawn_blocking(move || value.invalidate()).await;
                    if let Err(err) = invalidated {
                        log.error(&Error::Watch(format!(
                            "invalidating '{}' failed: {}",
                            path.display(),
                            err
                        )));
                    }
                }
                Some(event) => log.unrelated_event(&event),
                None => {
                    log.error(&Error::Watch(format!(
                        "change events for '{}' ended",
                        path.display()
                    )));
                    break;
                }
            },
            Some(err) = subscription.errors.recv() => {
                log.error(&Error::Watch(format!(
                    "error watching cache file '{}': {}",
                    path.display(),
                    err
                )));
            }
        }
    }
    subscription.close();
    debug!("Stopped watching '{}'", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::source::{ChangeEvent, ChangeKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Source whose streams are fed by the test.
    struct ChannelSource {
        subscription: Mutex<Option<Subscription>>,
        dirs: Mutex<Vec<PathBuf>>,
    }

    impl ChangeEventSource for ChannelSource {
        fn subscribe(&self, dir: &Path) -> Result<Subscription> {
            self.dirs.lock().unwrap().push(dir.to_path_buf());
            self.subscription
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::Watch("already subscribed".to_string()))
        }
    }

    fn channel_source() -> (ChannelSource, mpsc::Sender<ChangeEvent>, mpsc::Sender<Error>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (errors_tx, errors_rx) = mpsc::channel(8);
        let source = ChannelSource {
            subscription: Mutex::new(Some(Subscription::new(events_rx, errors_rx))),
            dirs: Mutex::new(Vec::new()),
        };
        (source, events_tx, errors_tx)
    }

    #[derive(Default)]
    struct RecordingLog {
        events: AtomicUsize,
        unrelated: AtomicUsize,
        errors: AtomicUsize,
    }

    impl NotifyLog for RecordingLog {
        fn event(&self, _event: &ChangeEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn unrelated_event(&self, _event: &ChangeEvent) {
            self.unrelated.fetch_add(1, Ordering::SeqCst);
        }

        fn error(&self, _err: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_reader(
        reads: &Arc<AtomicUsize>,
    ) -> impl Fn(&mut dyn Read) -> std::result::Result<String, BoxError> + Send + Sync + 'static
    {
        let reads = Arc::clone(reads);
        move |reader: &mut dyn Read| {
            reads.fetch_add(1, Ordering::SeqCst);
            let mut contents = String::new();
            reader.read_to_string(&mut contents)?;
            Ok(contents)
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_events_route_to_invalidate_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "one").unwrap();

        let (source, events, errors) = channel_source();
        let log = Arc::new(RecordingLog::default());
        let reads = Arc::new(AtomicUsize::new(0));
        let cache = FileCache::with_source(&file, counting_reader(&reads), &source, log.clone())
            .unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 0, "reader caches are lazy");
        assert_eq!(
            source.dirs.lock().unwrap().as_slice(),
            &[cache.path().parent().unwrap().to_path_buf()]
        );

        assert_eq!(cache.get().unwrap(), "one");
        let invalidations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invalidations);
        cache.on_invalidate(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events
            .send(ChangeEvent::new(cache.path().with_file_name("other.txt"), ChangeKind::Create))
            .await
            .unwrap();
        errors.send(Error::Watch("transient".to_string())).await.unwrap();
        settle().await;
        assert_eq!(log.unrelated.load(Ordering::SeqCst), 1);
        assert_eq!(log.errors.load(Ordering::SeqCst), 1);
        assert_eq!(invalidations.load(Ordering::SeqCst), 0);
        assert!(cache.is_watching(), "errors are not fatal");

        std::fs::write(&file, "two").unwrap();
        events
            .send(ChangeEvent::new(cache.path(), ChangeKind::Write))
            .await
            .unwrap();
        settle().await;
        assert_eq!(log.events.load(Ordering::SeqCst), 1);
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get().unwrap(), "two");
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_failure_keeps_watching() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "one").unwrap();

        let (source, events, _errors) = channel_source();
        let reads = Arc::new(AtomicUsize::new(0));
        let cache = FileCache::with_source(
            &file,
            counting_reader(&reads),
            &source,
            Arc::new(RecordingLog::default()),
        )
        .unwrap();

        std::fs::remove_file(&file).unwrap();
        let err = cache.get().unwrap_err();
        assert!(err.is_load());
        assert!(err.to_string().contains("failed to open file"));

        std::fs::write(&file, "back").unwrap();
        events
            .send(ChangeEvent::new(cache.path(), ChangeKind::Create))
            .await
            .unwrap();
        settle().await;
        assert!(cache.is_watching());
        assert_eq!(cache.get().unwrap(), "back");
    }

    #[tokio::test]
    async fn test_invalidate_during_slow_load_keeps_runtime_responsive() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "one").unwrap();

        let (source, events, _errors) = channel_source();
        let slow_reader = |reader: &mut dyn Read| -> std::result::Result<String, BoxError> {
            std::thread::sleep(Duration::from_millis(800));
            let mut contents = String::new();
            reader.read_to_string(&mut contents)?;
            Ok(contents)
        };
        let cache = FileCache::with_source(
            &file,
            slow_reader,
            &source,
            Arc::new(RecordingLog::default()),
        )
        .unwrap();

        let value = Arc::clone(cache.value());
        let load = tokio::task::spawn_blocking(move || value.get());
        // Let the load take the value's lock.
        settle().await;

        events
            .send(ChangeEvent::new(cache.path(), ChangeKind::Write))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_millis(300),
            "timer stalled for {:?} behind the watcher",
            elapsed
        );

        assert_eq!(load.await.unwrap().unwrap(), "one");
    }

    #[tokio::test]
    async fn test_cancel_stops_watcher_and_keeps_value() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "one").unwrap();

        let (source, events, _errors) = channel_source();
        let reads = Arc::new(AtomicUsize::new(0));
        let cache = FileCache::with_source(
            &file,
            counting_reader(&reads),
            &source,
            Arc::new(RecordingLog::default()),
        )
        .unwrap();
        cache.get().unwrap();

        cache.cancel();
        settle().await;
        assert!(!cache.is_watching());
        assert!(events.is_closed(), "subscription is closed on cancel");
        assert!(cache.value().is_loaded());
        assert_eq!(cache.get().unwrap(), "one");
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_stream_end_stops_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "one").unwrap();

        let (source, events, _errors) = channel_source();
        let log = Arc::new(RecordingLog::default());
        let reads = Arc::new(AtomicUsize::new(0));
        let cache =
            FileCache::with_source(&file, counting_reader(&reads), &source, log.clone()).unwrap();

        drop(events);
        settle().await;
        assert!(!cache.is_watching());
        assert_eq!(log.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _events, _errors) = channel_source();
        let err = FileCache::with_source(
            dir.path(),
            |_reader: &mut dyn Read| Ok(()),
            &source,
            Arc::new(RecordingLog::default()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotARegularFile(_)));
    }

    #[tokio::test]
    async fn test_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _events, _errors) = channel_source();
        let err = FileCache::with_source(
            dir.path().join("missing.txt"),
            |_reader: &mut dyn Read| Ok(()),
            &source,
            Arc::new(RecordingLog::default()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathResolution { .. }));
    }
}
