//! End-to-end tests for mirror-daemon.
//!
//! Runs the daemon against an in-process fake document service and checks
//! the mirror file, the messages sent, and cleanup on exit.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mirror_daemon::message::JSON0_TYPE_URI;
use mirror_daemon::{Daemon, MirrorConfig, ReconnectConfig};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

const CLIENT_ID: &str = "client-1";

enum Command {
    /// Send a raw frame to the connected client
    Send(Value),
    /// Close the current connection
    Close,
}

/// Fake document service: answers handshakes and subscriptions, acks ops,
/// and records every client message.
struct FakeService {
    addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    received: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
    submissions: Arc<AtomicUsize>,
}

async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

impl FakeService {
    /// Start a service holding `data` at `version` (`None` = not created).
    async fn start(data: Option<Value>, version: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let connection_count = Arc::clone(&connections);
        let submissions = Arc::new(AtomicUsize::new(0));
        let submission_count = Arc::clone(&submissions);

        tokio::spawn(async move {
            let mut version = version;
            let mut created = data.is_some();

            while let Ok((stream, _)) = listener.accept().await {
                connection_count.fetch_add(1, Ordering::SeqCst);
                let Ok(mut ws) = accept_async(stream).await else {
                    continue;
                };
                send(
                    &mut ws,
                    json!({"a": "init", "protocol": 1, "id": CLIENT_ID, "type": JSON0_TYPE_URI}),
                )
                .await;

                loop {
                    tokio::select! {
                        frame = ws.next() => {
                            let Some(Ok(Message::Text(text))) = frame else {
                                break;
                            };
                            let msg: Value = serde_json::from_str(&text).unwrap();
                            let _ = received_tx.send(msg.clone());

                            match msg["a"].as_str() {
                                Some("hs") => {
                                    send(&mut ws, json!({"a": "hs", "protocol": 1, "id": CLIENT_ID})).await;
                                }
                                Some("s") => {
                                    let snapshot = if created {
                                        json!({"v": version, "type": JSON0_TYPE_URI, "data": data})
                                    } else {
                                        json!({"v": version})
                                    };
                                    send(&mut ws, json!({"a": "s", "c": msg["c"], "d": msg["d"], "data": snapshot})).await;
                                }
                                Some("op") => {
                                    submission_count.fetch_add(1, Ordering::SeqCst);
                                    if msg.get("create").is_some() {
                                        created = true;
                                    }
                                    send(&mut ws, json!({
                                        "a": "op", "c": msg["c"], "d": msg["d"],
                                        "v": version, "src": CLIENT_ID, "seq": msg["seq"]
                                    }))
                                    .await;
                                    version += 1;
                                }
                                _ => {}
                            }
                        }
                        Some(command) = command_rx.recv() => match command {
                            Command::Send(value) => {
                                if value["a"] == "op" {
                                    version += 1;
                                }
                                send(&mut ws, value).await;
                            }
                            Command::Close => {
                                let _ = ws.close(None).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            commands,
            received,
            connections,
            submissions,
        }
    }

    /// Next client message with the given action.
    async fn expect(&mut self, action: &str) -> Value {
        timeout(Duration::from_secs(5), async {
            loop {
                let msg = self.received.recv().await.expect("service stopped");
                if msg["a"] == action {
                    return msg;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {:?} message", action))
    }

    fn push(&self, value: Value) {
        let _ = self.commands.send(Command::Send(value));
    }

    fn close_connection(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

struct RunningDaemon {
    mirror: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
    _temp: TempDir,
}

impl RunningDaemon {
    async fn start(service: &FakeService) -> Self {
        let temp = TempDir::new().unwrap();
        let config = MirrorConfig {
            document_id: "doc".into(),
            collection: "webstrates".into(),
            socket_url: format!("ws://{}/ws/", service.addr),
            mount_dir: temp.path().join("documents"),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                backoff_factor: 2.0,
                max_attempts: None,
            },
        };
        let mirror = config.mirror_path();

        let daemon = Daemon::new(config).await.unwrap();
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(daemon.run(async move {
            let _ = stop_rx.await;
        }));

        Self {
            mirror,
            stop: Some(stop),
            handle,
            _temp: temp,
        }
    }

    /// Signal shutdown; returns the run result and whether the mirror survived.
    async fn stop(mut self) -> (anyhow::Result<()>, bool) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let result = timeout(Duration::from_secs(5), &mut self.handle)
            .await
            .expect("Daemon did not stop")
            .unwrap();
        (result, self.mirror.exists())
    }
}

/// Poll until the file holds `expected`.
async fn wait_for_content(path: &Path, expected: &str) {
    let result = timeout(Duration::from_secs(5), async {
        loop {
            if std::fs::read_to_string(path).ok().as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "Timed out waiting for {:?}, found {:?}",
        expected,
        std::fs::read_to_string(path).ok()
    );
}

#[tokio::test]
async fn test_mirrors_document_and_submits_edits() {
    let mut service =
        FakeService::start(Some(json!(["html", {}, ["body", {}, ["p", {}, "hello"]]])), 3).await;
    let daemon = RunningDaemon::start(&service).await;

    assert_eq!(service.expect("hs").await, json!({"a": "hs"}));
    assert_eq!(
        service.expect("s").await,
        json!({"a": "s", "c": "webstrates", "d": "doc"})
    );
    wait_for_content(&daemon.mirror, "<html><body><p>hello</p></body></html>").await;

    // Local edit becomes a minimal op
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(&daemon.mirror, "<html><body><p>hello world</p></body></html>").unwrap();
    let op = service.expect("op").await;
    assert_eq!(op["v"], 3);
    assert_eq!(op["op"], json!([{"p": [2, 2, 2, 5], "si": " world"}]));

    // Remote change is written back
    service.push(json!({
        "a": "op", "c": "webstrates", "d": "doc", "v": 4, "src": "other", "seq": 1,
        "op": [{"p": [2, 3], "li": ["p", {}, "second"]}]
    }));
    wait_for_content(
        &daemon.mirror,
        "<html><body><p>hello world</p><p>second</p></body></html>",
    )
    .await;

    let (result, mirror_exists) = daemon.stop().await;
    assert!(result.is_ok());
    assert!(!mirror_exists);
}

#[tokio::test]
async fn test_creates_missing_document() {
    let mut service = FakeService::start(None, 0).await;
    let daemon = RunningDaemon::start(&service).await;

    let create = service.expect("op").await;
    assert_eq!(create["v"], Value::Null);
    assert_eq!(create["create"], json!({"type": "json0"}));

    let skeleton = service.expect("op").await;
    assert_eq!(skeleton["v"], 1);
    assert_eq!(
        skeleton["op"],
        json!([{"p": [], "oi": ["html", {}, ["body", {}]]}])
    );

    wait_for_content(&daemon.mirror, "<html><body></body></html>").await;
    let (result, _) = daemon.stop().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_service_error_is_fatal_and_cleans_up() {
    let mut service = FakeService::start(Some(json!(["html", {}, ["body", {}]])), 1).await;
    let mut daemon = RunningDaemon::start(&service).await;

    service.expect("s").await;
    wait_for_content(&daemon.mirror, "<html><body></body></html>").await;

    service.push(json!({"a": "s", "error": {"code": 4000, "message": "boom"}}));

    let result = timeout(Duration::from_secs(5), &mut daemon.handle)
        .await
        .expect("Daemon did not exit")
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert!(!daemon.mirror.exists());
}

#[tokio::test]
async fn test_wa_frames_are_ignored() {
    let mut service = FakeService::start(Some(json!(["html", {}, ["body", {}]])), 1).await;
    let daemon = RunningDaemon::start(&service).await;

    service.expect("s").await;
    wait_for_content(&daemon.mirror, "<html><body></body></html>").await;
    service.push(json!({"wa": "publish", "d": "doc", "m": "hello"}));
    service.push(json!({
        "a": "op", "c": "webstrates", "d": "doc", "v": 1, "src": "other", "seq": 1,
        "op": [{"p": [2, 2], "li": "still running"}]
    }));

    wait_for_content(&daemon.mirror, "<html><body>still running</body></html>").await;
    let (result, _) = daemon.stop().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_reconnects_and_resubscribes() {
    let mut service = FakeService::start(Some(json!(["html", {}, ["body", {}, "v1"]])), 1).await;
    let daemon = RunningDaemon::start(&service).await;

    service.expect("s").await;
    wait_for_content(&daemon.mirror, "<html><body>v1</body></html>").await;

    service.close_connection();
    service.expect("hs").await;
    service.expect("s").await;
    assert_eq!(service.connections.load(Ordering::SeqCst), 2);

    // The session is live again: remote ops keep flowing.
    service.push(json!({
        "a": "op", "c": "webstrates", "d": "doc", "v": 1, "src": "other", "seq": 1,
        "op": [{"p": [2, 2, 2], "si": " v2"}]
    }));
    wait_for_content(&daemon.mirror, "<html><body>v1 v2</body></html>").await;

    let (result, mirror_exists) = daemon.stop().await;
    assert!(result.is_ok());
    assert!(!mirror_exists);
}

#[tokio::test]
async fn test_inapplicable_remote_op_resubscribes_without_reset() {
    let mut service = FakeService::start(Some(json!(["html", {}, ["body", {}, "text"]])), 1).await;
    let daemon = RunningDaemon::start(&service).await;

    service.expect("s").await;
    wait_for_content(&daemon.mirror, "<html><body>text</body></html>").await;

    // Deletes text that is not there
    service.push(json!({
        "a": "op", "c": "webstrates", "d": "doc", "v": 1, "src": "other", "seq": 1,
        "op": [{"p": [2, 2, 0], "sd": "nope"}]
    }));

    service.expect("hs").await;
    service.expect("s").await;
    assert_eq!(service.connections.load(Ordering::SeqCst), 2);
    wait_for_content(&daemon.mirror, "<html><body>text</body></html>").await;
    // The shared document was never reset
    assert_eq!(service.submissions.load(Ordering::SeqCst), 0);

    let (result, _) = daemon.stop().await;
    assert!(result.is_ok());
}
