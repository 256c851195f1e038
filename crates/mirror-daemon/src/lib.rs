//! mirror-daemon library: Exposes the daemon components for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod message;
pub mod native_fs;
pub mod reconnect;
pub mod remote;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Args, MirrorConfig};
pub use connection::{Connection, TransportEvent};
pub use daemon::Daemon;
pub use message::{ClientMessage, Incoming, MAX_MESSAGE_SIZE, ServerMessage};
pub use native_fs::NativeFs;
pub use reconnect::{ReconnectConfig, ReconnectState, calculate_backoff};
pub use remote::{OpOutcome, RemoteDocument};
pub use watcher::{FileEventKind, FileWatcher};
