//! SyncController: keeps the mirror file and the shared document converged.
//!
//! Two reaction paths share one [`Session`]:
//!
//! 1. Remote path: the document changed (for any reason). Serialize the tree
//!    and write the mirror file unless it already holds that markup.
//! 2. Local path: the mirror file changed. Read it, skip it if it equals what
//!    was last seen, otherwise parse, normalize, diff against the document
//!    and submit. A rejected submission resets the document.
//!
//! Every write also records its markup as the last local content, so the
//! watcher notification caused by our own write is recognized as an echo.
//! Reactions are `&mut self` and run to completion; the caller serializes
//! them on one event loop.

use crate::diff::diff;
use crate::document::{Change, DocumentError, SharedDocument};
use crate::events::{EventBus, MirrorEvent};
use crate::fs::{FileSystem, FsError};
use crate::markup;
use crate::ot::Component;
use crate::recovery;
use crate::tree::{normalize, skeleton};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("File system error: {0}")]
    Fs(#[from] FsError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Per-subscription echo-suppression state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Session {
    /// Markup most recently written to the mirror file
    pub last_written_markup: Option<String>,
    /// Content most recently seen on the mirror file (read or written)
    pub last_local_markup: Option<String>,
    /// Whether the document subscription is live
    pub subscribed: bool,
}

/// Result of a remote-path reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The mirror file was rewritten
    Written,
    /// The mirror file already holds this markup; nothing to do
    Unchanged,
    /// The tree is absent or could not be serialized; nothing written
    Skipped,
}

/// Result of a local-path reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOutcome {
    /// No live subscription; the change will be picked up after resubscribing
    Inactive,
    /// The mirror file does not exist
    Missing,
    /// Content equals the last content seen
    Duplicate,
    /// Content is not valid markup; the edit was skipped
    Unparseable,
    /// Content parses to the current tree
    NoChanges,
    /// An operation with this many components was submitted
    Submitted(usize),
    /// The submission was rejected and the document was reset
    Recovered,
}

/// Drives one document/mirror-file pair.
pub struct SyncController<D, F> {
    document: D,
    fs: F,
    mirror_path: String,
    session: Session,
    events: Arc<EventBus>,
}

impl<D: SharedDocument, F: FileSystem> SyncController<D, F> {
    pub fn new(document: D, fs: F, mirror_path: impl Into<String>) -> Self {
        Self {
            document,
            fs,
            mirror_path: mirror_path.into(),
            session: Session::default(),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn mirror_path(&self) -> &str {
        &self.mirror_path
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_active(&self) -> bool {
        self.session.subscribed
    }

    /// Start a session after a successful subscription.
    ///
    /// Creates the document with the skeleton tree if it has no type yet,
    /// then writes the current tree to the mirror file. Also used after a
    /// resubscription: the echo state is reset so the file is rewritten from
    /// the authoritative tree.
    pub async fn bootstrap(&mut self) -> Result<RemoteOutcome> {
        if !self.document.exists() {
            info!("Document doesn't exist on server, creating it");
            self.document.create()?;
            self.document.submit(vec![Component::replace_root(skeleton())])?;
            self.events.emit(MirrorEvent::DocumentCreated);
        }

        self.session = Session {
            subscribed: true,
            ..Session::default()
        };
        self.on_remote_change().await
    }

    /// Mark the subscription as lost. Local edits are held until the next
    /// `bootstrap`, since the tree may be stale.
    pub fn suspend(&mut self) {
        if self.session.subscribed {
            debug!("Subscription suspended");
        }
        self.session.subscribed = false;
    }

    /// React to a change notification from the document.
    pub async fn on_document_changed(&mut self, change: &Change) -> Result<RemoteOutcome> {
        debug!(
            "Document changed ({:?}, {} component(s))",
            change.origin,
            change.op.len()
        );
        self.on_remote_change().await
    }

    /// Remote path: reflect the current tree into the mirror file.
    pub async fn on_remote_change(&mut self) -> Result<RemoteOutcome> {
        let Some(tree) = self.document.snapshot() else {
            debug!("Document has no content yet, nothing to write");
            return Ok(RemoteOutcome::Skipped);
        };

        let markup = match markup::to_markup(tree) {
            Ok(markup) => markup,
            Err(e) => {
                warn!("Unable to serialize document tree: {}", e);
                self.events.emit(MirrorEvent::SerializeFailed {
                    reason: e.to_string(),
                });
                return Ok(RemoteOutcome::Skipped);
            }
        };

        if self.session.last_written_markup.as_deref() == Some(markup.as_str()) {
            return Ok(RemoteOutcome::Unchanged);
        }
        // The file already holds this exact markup (a canonical local edit).
        if self.session.last_local_markup.as_deref() == Some(markup.as_str()) {
            self.session.last_written_markup = Some(markup);
            return Ok(RemoteOutcome::Unchanged);
        }

        self.fs.write(&self.mirror_path, markup.as_bytes()).await?;
        debug!("Wrote {} bytes to {}", markup.len(), self.mirror_path);
        self.events.emit(MirrorEvent::FileWritten {
            path: self.mirror_path.clone(),
            bytes: markup.len(),
        });

        self.session.last_local_markup = Some(markup.clone());
        self.session.last_written_markup = Some(markup);
        Ok(RemoteOutcome::Written)
    }

    /// Local path: turn the mirror file's content into a submitted operation.
    pub async fn on_local_change(&mut self) -> Result<LocalOutcome> {
        if !self.session.subscribed {
            debug!("Ignoring local change while unsubscribed");
            return Ok(LocalOutcome::Inactive);
        }

        let bytes = match self.fs.read(&self.mirror_path).await {
            Ok(bytes) => bytes,
            Err(FsError::NotFound(_)) => {
                debug!("Mirror file {} is gone", self.mirror_path);
                return Ok(LocalOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(e) => {
                warn!("Mirror file is not valid UTF-8: {}", e);
                self.events.emit(MirrorEvent::ParseFailed {
                    reason: e.to_string(),
                });
                return Ok(LocalOutcome::Unparseable);
            }
        };

        if self.session.last_local_markup.as_deref() == Some(content.as_str()) {
            return Ok(LocalOutcome::Duplicate);
        }
        self.session.last_local_markup = Some(content.clone());

        let parsed = match markup::from_markup(&content) {
            Ok(node) => node,
            Err(e) => {
                warn!("Unable to parse mirror file, skipping: {}", e);
                self.events.emit(MirrorEvent::ParseFailed {
                    reason: e.to_string(),
                });
                return Ok(LocalOutcome::Unparseable);
            }
        };

        let new_tree = normalize(&parsed.to_value());
        let current = self.document.snapshot().cloned().unwrap_or(Value::Null);
        let op = diff(&current, &new_tree);
        if op.is_empty() {
            return Ok(LocalOutcome::NoChanges);
        }

        let components = op.len();
        match self.document.submit(op) {
            Ok(()) => {
                debug!("Submitted {} component(s)", components);
                self.events.emit(MirrorEvent::OpSubmitted { components });
                self.on_remote_change().await?;
                Ok(LocalOutcome::Submitted(components))
            }
            Err(e) => {
                warn!("Invalid document, rebuilding: {}", e);
                self.recover(&e.to_string()).await?;
                Ok(LocalOutcome::Recovered)
            }
        }
    }

    /// Reset the document to the skeleton tree and mirror the result.
    pub async fn recover(&mut self, reason: &str) -> Result<RemoteOutcome> {
        recovery::recover(&mut self.document)?;
        info!("Document reset to skeleton ({})", reason);
        self.events.emit(MirrorEvent::Recovered {
            reason: reason.to_string(),
        });
        self.on_remote_change().await
    }

    /// End the session: delete the mirror file (already-absent is fine) and
    /// hand back the document.
    pub async fn shutdown(self) -> Result<D> {
        match self.fs.delete(&self.mirror_path).await {
            Ok(()) => debug!("Removed {}", self.mirror_path),
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.document)
    }
}
