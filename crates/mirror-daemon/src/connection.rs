//! WebSocket connection to the document service.
//!
//! The stream is split: a spawned read task forwards classified frames as
//! [`TransportEvent`]s on one channel, and the write half is shared behind
//! a mutex for sending.

use crate::message::{ClientMessage, Incoming, MAX_MESSAGE_SIZE, classify};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Event emitted by the connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// A classified frame from the service
    Message(Incoming),
    /// The connection was closed
    Closed,
}

/// An open connection to the service.
pub struct Connection {
    url: String,
    write: Arc<Mutex<SplitSink<WsStream, Message>>>,
    read_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connect to `url` and start forwarding frames to the returned channel.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_SIZE);
        config.max_frame_size = Some(MAX_MESSAGE_SIZE);

        let (ws_stream, _) = connect_async_with_config(url, Some(config), false).await?;
        debug!("Connected to {}", url);

        let (write, read) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let read_url = url.to_string();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_url, read, event_tx).await;
        });

        Ok((
            Self {
                url: url.to_string(),
                write: Arc::new(Mutex::new(write)),
                read_task: Some(read_task),
            },
            event_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Read loop that forwards classified frames to the event channel.
    async fn read_loop(
        url: String,
        mut read: SplitStream<WsStream>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Dropping non-UTF-8 binary frame from {}", url);
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", url);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    match classify(&text) {
                        Ok(incoming) => {
                            if event_tx.send(TransportEvent::Message(incoming)).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping frame from {}: {}", url, e),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", url);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", url, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", url);
                    break;
                }
            }
        }

        let _ = event_tx.send(TransportEvent::Closed);
    }

    /// Send one message as a text frame.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_text()?;
        let mut write = self.write.lock().await;
        write
            .send(Message::text(text))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Send several messages in order.
    pub async fn send_all(&self, messages: Vec<ClientMessage>) -> Result<()> {
        for message in messages {
            self.send(&message).await?;
        }
        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
