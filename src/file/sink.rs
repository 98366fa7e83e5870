//! Log sinks for filesystem change notifications.

use super::source::ChangeEvent;
use crate::error::Error;

/// Receives what the file watcher sees, so changes can be logged.
///
/// Default methods write through the `log` crate. The default sink used by
/// [`WatchConfig`](super::WatchConfig) is [`NoOpNotifyLog`].
pub trait NotifyLog: Send + Sync {
    /// An event for the watched file. The cache is invalidated right after.
    fn event(&self, event: &ChangeEvent) {
        info!("fs-event: [{}] {}", event.kind, event.path.display());
    }

    /// An event for another entry in the watched directory.
    fn unrelated_event(&self, event: &ChangeEvent) {
        trace!("fs-event (unrelated): [{}] {}", event.kind, event.path.display());
    }

    /// A failure reported by the change-event source. Watching continues.
    fn error(&self, err: &Error) {
        error!("fs-event: ERROR: {}", err);
    }
}

/// Sink that logs through the `log` crate.
#[derive(Clone, Debug, Default)]
pub struct LogNotify;

impl NotifyLog for LogNotify {}

/// Sink that discards everything.
#[derive(Clone, Debug, Default)]
pub struct NoOpNotifyLog;

impl NotifyLog for NoOpNotifyLog {
    fn event(&self, _event: &ChangeEvent) {}
    fn unrelated_event(&self, _event: &ChangeEvent) {}
    fn error(&self, _err: &Error) {}
}
