//! Change-event sources.
//!
//! A [`ChangeEventSource`] turns a directory into a [`Subscription`]: a
//! stream of [`ChangeEvent`]s plus a separate stream of errors. The file
//! cache only asks whether an event's path equals the watched file.
//!
//! [`PollWatcher`] is the built-in source. It snapshots the directory on an
//! interval and reports what changed between snapshots.

use crate::error::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// Kind of filesystem change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Create => "CREATE",
            ChangeKind::Write => "WRITE",
            ChangeKind::Remove => "REMOVE",
            ChangeKind::Rename => "RENAME",
            ChangeKind::Chmod => "CHMOD",
        };
        f.write_str(name)
    }
}

/// A change to one path inside a watched directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        ChangeEvent {
            path: path.into(),
            kind,
        }
    }
}

/// Live subscription to a directory's change events.
///
/// Dropping or [closing](Subscription::close) the subscription stops the
/// producer, if it registered a shutdown channel.
pub struct Subscription {
    pub(crate) events: mpsc::Receiver<ChangeEvent>,
    pub(crate) errors: mpsc::Receiver<Error>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Subscription {
    /// Wrap the receiving halves of an event stream and an error stream.
    pub fn new(events: mpsc::Receiver<ChangeEvent>, errors: mpsc::Receiver<Error>) -> Self {
        Subscription {
            events,
            errors,
            shutdown: None,
        }
    }

    /// Register the channel used to stop the producer on close.
    pub fn with_shutdown(mut self, shutdown: watch::Sender<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Stop the producer and close both streams.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.events.close();
        self.errors.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("open", &self.shutdown.is_some())
            .finish()
    }
}

/// Source of change events for a directory.
///
/// Implement this to plug in a native notification backend. Subscribing may
/// spawn tokio tasks, so it is called from within a runtime.
pub trait ChangeEventSource: Send + Sync {
    /// Start watching `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Watch` if the directory cannot be watched.
    fn subscribe(&self, dir: &Path) -> Result<Subscription>;
}

/// Stamp used to detect a changed entry between two polls.
///
/// `identity` carries the inode and status-change time where the platform
/// has them. Writes and `utime` calls both move the ctime, so a rewrite that
/// keeps length and mtime is still seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
    identity: Option<(u64, i64, i64)>,
    digest: Option<u64>,
}

type Snapshot = HashMap<PathBuf, Stamp>;

/// Polling [`ChangeEventSource`] driven by a tokio interval.
///
/// Reports `Create`, `Write` and `Remove` events for the entries of the
/// watched directory. A change is visible after at most one poll interval.
#[derive(Clone, Debug)]
pub struct PollWatcher {
    poll_interval: Duration,
    capacity: usize,
    compare_contents: bool,
}

impl PollWatcher {
    /// Default capacity of the event and error channels.
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(poll_interval: Duration) -> Self {
        PollWatcher {
            poll_interval,
            capacity: Self::DEFAULT_CAPACITY,
            compare_contents: false,
        }
    }

    /// Hash the contents of regular files on every poll.
    pub fn with_compare_contents(mut self, compare_contents: bool) -> Self {
        self.compare_contents = compare_contents;
        self
    }

    /// Set the channel capacity. A full channel delays polling until drained.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl ChangeEventSource for PollWatcher {
    fn subscribe(&self, dir: &Path) -> Result<Subscription> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| Error::Watch(format!("no tokio runtime to poll from: {}", err)))?;
        let initial = snapshot(dir, self.compare_contents).map_err(|err| {
            Error::Watch(format!("unable to read directory '{}': {}", dir.display(), err))
        })?;

        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let (errors_tx, errors_rx) = mpsc::channel(self.capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        runtime.spawn(poll_directory(
            dir.to_path_buf(),
            self.poll_interval,
            self.compare_contents,
            initial,
            events_tx,
            errors_tx,
            shutdown_rx,
        ));
        debug!(
            "Polling '{}' every {:?}",
            dir.display(),
            self.poll_interval
        );

        Ok(Subscription::new(events_rx, errors_rx).with_shutdown(shutdown_tx))
    }
}

async fn poll_directory(
    dir: PathBuf,
    poll_interval: Duration,
    compare_contents: bool,
    mut previous: Snapshot,
    events: mpsc::Sender<ChangeEvent>,
    errors: mpsc::Sender<Error>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let scan_dir = dir.clone();
                let scanned =
                    tokio::task::spawn_blocking(move || snapshot(&scan_dir, compare_contents))
                        .await
                        .map_err(std::io::Error::other)
                        .and_then(|scan| scan);
                let current = match scanned {
                    Ok(current) => current,
                    Err(err) => {
                        let err = Error::Watch(format!(
                            "unable to read directory '{}': {}",
                            dir.display(),
                            err
                        ));
                        if errors.send(err).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                for event in diff(&previous, &current) {
                    if events.send(event).await.is_err() {
                        trace!("Subscriber for '{}' went away", dir.display());
                        return;
                    }
                }
                previous = current;
            }
        }
    }
    trace!("Stopped polling '{}'", dir.display());
}

fn snapshot(dir: &Path, compare_contents: bool) -> std::io::Result<Snapshot> {
    let mut entries = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        // Entries can vanish between listing and stat.
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let path = entry.path();
        let digest = if compare_contents && metadata.is_file() {
            std::fs::read(&path).ok().map(|contents| {
                let mut hasher = DefaultHasher::new();
                contents.hash(&mut hasher);
                hasher.finish()
            })
        } else {
            None
        };
        entries.insert(
            path,
            Stamp {
                modified: metadata.modified().ok(),
                len: metadata.len(),
                identity: identity(&metadata),
                digest,
            },
        );
    }
    Ok(entries)
}

#[cfg(unix)]
fn identity(metadata: &std::fs::Metadata) -> Option<(u64, i64, i64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.ino(), metadata.ctime(), metadata.ctime_nsec()))
}

#[cfg(not(unix))]
fn identity(_metadata: &std::fs::Metadata) -> Option<(u64, i64, i64)> {
    None
}

fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for (path, stamp) in current {
        match previous.get(path) {
            None => events.push(ChangeEvent::new(path.clone(), ChangeKind::Create)),
            Some(old) if old != stamp => {
                events.push(ChangeEvent::new(path.clone(), ChangeKind::Write))
            }
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            events.push(ChangeEvent::new(path.clone(), ChangeKind::Remove));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(len: u64) -> Stamp {
        Stamp {
            modified: Some(SystemTime::UNIX_EPOCH),
            len,
            identity: None,
            digest: None,
        }
    }

    #[test]
    fn test_diff_sees_same_length_same_mtime_rewrite() {
        let path = PathBuf::from("/d/settings.json");
        let before = Stamp {
            identity: Some((7, 100, 0)),
            ..stamp(17)
        };
        let after = Stamp {
            identity: Some((7, 100, 500)),
            ..stamp(17)
        };
        let previous: Snapshot = [(path.clone(), before)].into_iter().collect();
        let current: Snapshot = [(path.clone(), after)].into_iter().collect();
        assert_eq!(
            diff(&previous, &current),
            vec![ChangeEvent::new(path.clone(), ChangeKind::Write)]
        );

        let hashed = |digest| Stamp {
            digest: Some(digest),
            ..stamp(17)
        };
        let previous: Snapshot = [(path.clone(), hashed(1))].into_iter().collect();
        let current: Snapshot = [(path.clone(), hashed(2))].into_iter().collect();
        assert_eq!(
            diff(&previous, &current),
            vec![ChangeEvent::new(path, ChangeKind::Write)]
        );
    }

    #[test]
    fn test_snapshot_hashes_contents_when_asked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("settings.json");
        std::fs::write(&file, r#"{"a":"a","b":"b"}"#).expect("write");

        let plain = snapshot(dir.path(), false).expect("snapshot");
        assert_eq!(plain[&file].digest, None);

        let before = snapshot(dir.path(), true).expect("snapshot");
        std::fs::write(&file, r#"{"a":"c","b":"d"}"#).expect("rewrite");
        let after = snapshot(dir.path(), true).expect("snapshot");
        assert_eq!(before[&file].len, after[&file].len);
        assert_ne!(before[&file].digest, after[&file].digest);
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_sees_rewrite_with_restored_mtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("settings.json");
        std::fs::write(&file, r#"{"a":"a","b":"b"}"#).expect("write");
        let mtime = std::fs::metadata(&file)
            .and_then(|m| m.modified())
            .expect("mtime");
        let before = snapshot(dir.path(), false).expect("snapshot");

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&file, r#"{"a":"c","b":"d"}"#).expect("rewrite");
        std::fs::File::options()
            .write(true)
            .open(&file)
            .and_then(|f| f.set_modified(mtime))
            .expect("restore mtime");

        let after = snapshot(dir.path(), false).expect("snapshot");
        assert_eq!(before[&file].modified, after[&file].modified);
        assert_eq!(before[&file].len, after[&file].len);
        assert_eq!(
            diff(&before, &after),
            vec![ChangeEvent::new(file, ChangeKind::Write)]
        );
    }

    #[test]
    fn test_diff_reports_create_write_remove() {
        let previous: Snapshot = [
            (PathBuf::from("/d/kept"), stamp(1)),
            (PathBuf::from("/d/changed"), stamp(1)),
            (PathBuf::from("/d/removed"), stamp(1)),
        ]
        .into_iter()
        .collect();
        let current: Snapshot = [
            (PathBuf::from("/d/kept"), stamp(1)),
            (PathBuf::from("/d/changed"), stamp(2)),
            (PathBuf::from("/d/created"), stamp(1)),
        ]
        .into_iter()
        .collect();

        let mut events = diff(&previous, &current);
        events.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            events,
            vec![
                ChangeEvent::new("/d/changed", ChangeKind::Write),
                ChangeEvent::new("/d/created", ChangeKind::Create),
                ChangeEvent::new("/d/removed", ChangeKind::Remove),
            ]
        );
    }

    #[test]
    fn test_change_kind_display() {
        assert_eq!(ChangeKind::Write.to_string(), "WRITE");
        assert_eq!(ChangeKind::Remove.to_string(), "REMOVE");
    }

    #[tokio::test]
    async fn test_poll_watcher_reports_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dir_path = dir.path().canonicalize().expect("canonicalize");
        let watcher = PollWatcher::new(Duration::from_millis(10));
        let mut subscription = watcher.subscribe(&dir_path).expect("subscribe");

        let file = dir_path.join("new.txt");
        std::fs::write(&file, b"hello").expect("write");

        let event = tokio::time::timeout(Duration::from_secs(2), subscription.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended");
        assert_eq!(event, ChangeEvent::new(file, ChangeKind::Create));
    }

    #[tokio::test]
    async fn test_poll_watcher_rejects_missing_dir() {
        let watcher = PollWatcher::new(Duration::from_millis(10));
        let err = watcher
            .subscribe(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, Error::Watch(_)));
    }

    #[test]
    fn test_poll_watcher_requires_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = PollWatcher::new(Duration::from_millis(10))
            .subscribe(dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("no tokio runtime"));
    }
}
