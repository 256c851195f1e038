//! Debounced watcher for the mirror file.
//!
//! Watches the mount directory non-recursively with notify-debouncer-mini
//! and forwards events for the one mirror file. Editors often save by
//! replacing the file, so the directory is watched rather than the file.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce period for bursts of events during a save.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Type of mirror file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Watcher for the mirror file.
pub struct FileWatcher {
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEventKind>,
}

impl FileWatcher {
    /// Watch `mount_dir` for changes to the file named `file_name`.
    ///
    /// The directory must exist.
    pub fn new(mount_dir: &Path, file_name: &str) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let mount_dir = mount_dir.canonicalize()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let target = OsString::from(file_name);

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    if let Some(kind) = Self::process_events(&events, &target) {
                        // Receiver dropped means the daemon is shutting down
                        let _ = event_tx.send(kind);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&mount_dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Collapse a debounced batch into at most one event for the mirror file.
    fn process_events(events: &[DebouncedEvent], target: &OsString) -> Option<FileEventKind> {
        let event = events
            .iter()
            .find(|event| event.path.file_name() == Some(target.as_os_str()))?;

        let kind = if event.path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };
        debug!("Mirror file event: {:?}", kind);
        Some(kind)
    }

    /// Get the receiver for mirror file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEventKind> {
        &mut self.event_rx
    }
}
