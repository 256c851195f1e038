//! mirror-core: keeps a shared JsonML document and a local markup file in sync.
//!
//! This crate provides the core functionality for:
//! - Normalizing JsonML trees and converting them to and from markup
//! - json0-style operations: applying them, transforming concurrent ones, and
//!   diffing two trees into them
//! - The sync controller that reacts to document and file changes
//! - SharedDocument and FileSystem trait abstractions

pub mod controller;
pub mod diff;
pub mod document;
pub mod events;
pub mod fs;
pub mod markup;
pub mod ot;
pub mod recovery;
pub mod transform;
pub mod tree;

pub use controller::{ControllerError, LocalOutcome, RemoteOutcome, Session, SyncController};
pub use diff::diff;
pub use document::{Change, DocumentError, InMemoryDocument, Origin, SharedDocument};
pub use events::{EventBus, MirrorEvent, Subscription};
pub use fs::{FileSystem, FsError, InMemoryFs};
pub use markup::{ParseError, from_markup, to_markup};
pub use ot::{Action, Component, OtError, Path, PathSegment, apply};
pub use transform::{Side, transform, transform_x};
pub use tree::{Element, MalformedTreeError, Node, normalize, skeleton};
