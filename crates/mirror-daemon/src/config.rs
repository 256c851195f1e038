//! Command-line arguments and the resolved daemon configuration.

use crate::reconnect::ReconnectConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default document identifier.
pub const DEFAULT_DOCUMENT_ID: &str = "contenteditable";

/// Default service endpoint.
pub const DEFAULT_HOST: &str = "ws://localhost:7007";

/// Default collection holding the documents.
pub const DEFAULT_COLLECTION: &str = "webstrates";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid document id {0:?}: must be a plain file name")]
    InvalidDocumentId(String),

    #[error("Invalid reconnect settings: {0}")]
    InvalidReconnect(String),
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mirror-daemon")]
#[command(about = "Mirror a shared markup document into a local file")]
pub struct Args {
    /// Identifier of the document to mirror
    #[arg(long, env = "MIRROR_DOCUMENT_ID", default_value = DEFAULT_DOCUMENT_ID)]
    pub id: String,

    /// Service endpoint; hosts without a ws:// or wss:// scheme use wss://
    #[arg(short = 'H', long, env = "MIRROR_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Directory the mirror file is written to
    #[arg(long, default_value = "./documents")]
    pub mount_dir: PathBuf,

    /// Collection the document lives in
    #[arg(long, default_value = DEFAULT_COLLECTION)]
    pub collection: String,

    /// Delay before the first reconnect attempt, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub reconnect_delay_ms: u64,

    /// Upper bound for the reconnect delay, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Multiplier applied to the delay after each failed attempt
    #[arg(long, default_value_t = 2.0)]
    pub reconnect_factor: f64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Settings resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    pub document_id: String,
    pub collection: String,
    /// Full WebSocket URL, e.g. `ws://localhost:7007/ws/`
    pub socket_url: String,
    pub mount_dir: PathBuf,
    pub reconnect: ReconnectConfig,
}

impl MirrorConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let id = args.id.trim();
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(ConfigError::InvalidDocumentId(args.id.clone()));
        }

        if !(args.reconnect_factor.is_finite() && args.reconnect_factor >= 1.0) {
            return Err(ConfigError::InvalidReconnect(format!(
                "factor must be at least 1.0, got {}",
                args.reconnect_factor
            )));
        }
        if args.reconnect_max_delay_ms < args.reconnect_delay_ms {
            return Err(ConfigError::InvalidReconnect(
                "max delay is shorter than the initial delay".into(),
            ));
        }

        Ok(Self {
            document_id: id.to_string(),
            collection: args.collection.clone(),
            socket_url: socket_url(&args.host),
            mount_dir: args.mount_dir.clone(),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(args.reconnect_delay_ms),
                max_delay: Duration::from_millis(args.reconnect_max_delay_ms),
                backoff_factor: args.reconnect_factor,
                max_attempts: None,
            },
        })
    }

    /// Mirror file name, relative to the mount directory.
    pub fn mirror_file(&self) -> String {
        format!("{}.html", self.document_id)
    }

    /// Absolute-or-relative path of the mirror file on disk.
    pub fn mirror_path(&self) -> PathBuf {
        self.mount_dir.join(self.mirror_file())
    }
}

/// Give schemeless hosts `wss://`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_string()
    } else {
        format!("wss://{}", host)
    }
}

/// WebSocket URL for a host: the normalized host followed by `/ws/`.
pub fn socket_url(host: &str) -> String {
    format!("{}/ws/", normalize_host(host).trim_end_matches('/'))
}
