//! The daemon event loop.
//!
//! One `tokio::select!` loop owns the controller and reacts to transport
//! frames, mirror file events, the reconnect timer and the shutdown signal.
//! Each reaction runs to completion before the next event is taken.

use crate::config::MirrorConfig;
use crate::connection::{Connection, TransportEvent};
use crate::message::{ClientMessage, Incoming, ServerMessage, SnapshotData};
use crate::native_fs::NativeFs;
use crate::reconnect::ReconnectState;
use crate::remote::{OpOutcome, RemoteDocument};
use crate::watcher::{FileEventKind, FileWatcher};
use anyhow::{Result, anyhow, bail};
use mirror_core::{FileSystem, SyncController};
use std::future::{Future, pending};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

/// Daemon state holding all components.
pub struct Daemon {
    config: MirrorConfig,
    controller: SyncController<RemoteDocument, NativeFs>,
    connection: Option<Connection>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    watcher: FileWatcher,
    reconnect: ReconnectState,
}

impl Daemon {
    /// Create the mount directory and start watching it.
    pub async fn new(config: MirrorConfig) -> Result<Self> {
        let fs = NativeFs::new(config.mount_dir.clone());
        fs.mkdir("").await?;

        let watcher = FileWatcher::new(&config.mount_dir, &config.mirror_file())?;
        let document = RemoteDocument::new(config.collection.clone(), config.document_id.clone());
        let controller = SyncController::new(document, fs, config.mirror_file());

        Ok(Self {
            config,
            controller,
            connection: None,
            transport_rx: None,
            watcher,
            reconnect: ReconnectState::new(),
        })
    }

    /// Run until `shutdown` resolves or the service reports an error.
    ///
    /// The mirror file is deleted either way. A service error is returned
    /// after cleanup.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "Mirroring {}/{} into {}",
            self.config.collection,
            self.config.document_id,
            self.config.mirror_path().display()
        );

        let outcome = self.event_loop(shutdown).await;
        if let Err(e) = &outcome {
            error!("{}", e);
        }

        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.controller.shutdown().await?;
        info!("Removed {}", self.config.mirror_path().display());

        outcome
    }

    async fn event_loop(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        self.connect().await?;

        loop {
            tokio::select! {
                event = next_transport_event(&mut self.transport_rx) => {
                    match event {
                        Some(TransportEvent::Message(incoming)) => self.on_incoming(incoming).await?,
                        Some(TransportEvent::Closed) | None => self.on_closed()?,
                    }
                }

                Some(kind) = self.watcher.event_rx().recv() => {
                    self.on_file_event(kind).await?;
                }

                _ = sleep_until_scheduled(self.reconnect.next_attempt_at) => {
                    self.reconnect.clear_schedule();
                    self.connect().await?;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    /// Open the socket and subscribe; on failure schedule another attempt.
    async fn connect(&mut self) -> Result<()> {
        let url = self.config.socket_url.clone();
        match Connection::connect(&url).await {
            Ok((connection, rx)) => {
                info!("Connected to {}", url);
                let subscribe = self.controller.document().subscribe_message();
                if let Err(e) = connection.send_all(vec![ClientMessage::Handshake, subscribe]).await {
                    warn!("Unable to subscribe: {}", e);
                    return self.schedule_reconnect();
                }
                self.connection = Some(connection);
                self.transport_rx = Some(rx);
                Ok(())
            }
            Err(e) => {
                warn!("Unable to connect to {}: {}", url, e);
                self.schedule_reconnect()
            }
        }
    }

    fn schedule_reconnect(&mut self) -> Result<()> {
        if self.reconnect.exceeded_max_attempts(&self.config.reconnect) {
            bail!("Giving up after {} reconnect attempts", self.reconnect.attempts);
        }
        self.reconnect
            .schedule_reconnect(Instant::now(), &self.config.reconnect);
        Ok(())
    }

    /// Drop the connection and local state; the next subscription reply
    /// brings a fresh snapshot.
    async fn resubscribe(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.on_closed()
    }

    fn on_closed(&mut self) -> Result<()> {
        info!("Connection closed");
        self.connection = None;
        self.transport_rx = None;
        self.controller.suspend();
        self.schedule_reconnect()
    }

    async fn on_incoming(&mut self, incoming: Incoming) -> Result<()> {
        match incoming {
            Incoming::Error(reason) => return Err(anyhow!("Service error: {}", reason)),
            Incoming::Ignored => {}
            Incoming::Unknown(action) => debug!("Ignoring message with action {:?}", action),
            Incoming::Message(message) => self.on_message(message).await?,
        }
        self.flush().await;
        Ok(())
    }

    async fn on_message(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Init { id } | ServerMessage::Handshake { id } => {
                self.controller.document_mut().set_client_id(id);
            }
            ServerMessage::Subscribed { data, .. } => {
                let snapshot = data.unwrap_or(SnapshotData {
                    v: 0,
                    doc_type: None,
                    data: None,
                });
                self.controller.document_mut().on_subscribed(snapshot);
                self.reconnect.reset();
                self.controller.bootstrap().await?;
                info!("Subscribed, mirror at {}", self.config.mirror_path().display());
            }
            ServerMessage::Op(op) => match self.controller.document_mut().on_op(op) {
                Ok(OpOutcome::Applied(change)) => {
                    self.controller.on_document_changed(&change).await?;
                }
                Ok(OpOutcome::Acknowledged) | Ok(OpOutcome::Ignored) => {}
                Err(e) => {
                    warn!("Remote operation does not apply, resubscribing: {}", e);
                    self.resubscribe().await?;
                }
            },
        }
        Ok(())
    }

    async fn on_file_event(&mut self, kind: FileEventKind) -> Result<()> {
        if kind == FileEventKind::Deleted {
            debug!("Mirror file deleted; it is rewritten on the next remote change");
        }
        let outcome = self.controller.on_local_change().await?;
        debug!("Local change: {:?}", outcome);
        self.flush().await;
        Ok(())
    }

    /// Send whatever the document queued.
    async fn flush(&mut self) {
        let outgoing = self.controller.document_mut().take_outgoing();
        if outgoing.is_empty() {
            return;
        }
        match &self.connection {
            Some(connection) => {
                if let Err(e) = connection.send_all(outgoing).await {
                    // The read task reports the close; the queue is rebuilt on resubscribe
                    warn!("{}", e);
                }
            }
            None => debug!("Not connected, dropping {} message(s)", outgoing.len()),
        }
    }
}

async fn next_transport_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_scheduled(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
