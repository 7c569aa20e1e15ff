#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Route library logs to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

/// Instructions broadcast to every live mock connection.
#[derive(Clone, Copy, Debug)]
pub enum Control {
    /// Send a close frame with the given code, then hang up
    Close(u16),
    /// Hang up without a close frame (abnormal closure)
    Drop,
}

/// Mock WebSocket server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Broadcast control instructions to ALL connected clients
    control_tx: broadcast::Sender<Control>,
    /// Receives text frames sent by clients
    frame_rx: mpsc::UnboundedReceiver<String>,
    /// Number of accepted connections so far
    connections: Arc<AtomicUsize>,
    /// Request URIs of accepted upgrades, in order
    uris: Arc<Mutex<Vec<String>>>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (control_tx, _) = broadcast::channel::<Control>(16);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicUsize::new(0));
        let uris = Arc::new(Mutex::new(Vec::new()));

        let broadcast_tx = message_tx.clone();
        let control_bcast = control_tx.clone();
        let connections_counter = Arc::clone(&connections);
        let uri_log = Arc::clone(&uris);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let uri_log = Arc::clone(&uri_log);
                let callback = move |req: &Request, resp: Response| {
                    uri_log.lock().unwrap().push(req.uri().to_string());
                    Ok(resp)
                };
                let Ok(ws_stream) =
                    tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };
                connections_counter.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let frame_tx = frame_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let mut ctrl_rx = control_bcast.subscribe();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            // Frames sent by the client
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(frame_tx.send(text.to_string()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            // Frames this test wants pushed to the client
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            // Connection-level control from the test
                            ctrl = ctrl_rx.recv() => {
                                match ctrl {
                                    Ok(Control::Close(code)) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: "".into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Ok(Control::Drop) | Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            control_tx,
            frame_rx,
            connections,
            uris,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    /// Send a text frame to all connected clients.
    pub fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    /// Close every live connection with the given close code.
    pub fn close_all(&self, code: u16) {
        drop(self.control_tx.send(Control::Close(code)));
    }

    /// Hang up every live connection without a close frame.
    pub fn drop_all(&self) {
        drop(self.control_tx.send(Control::Drop));
    }

    /// Receive the next text frame sent by any client.
    pub async fn recv_frame(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.frame_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next frame that is not a keep-alive.
    pub async fn recv_non_keepalive_frame(&mut self) -> Option<String> {
        loop {
            let frame = self.recv_frame().await?;
            let value: serde_json::Value = serde_json::from_str(&frame).ok()?;
            if value.get("type").and_then(serde_json::Value::as_str) != Some("pong") {
                return Some(frame);
            }
        }
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait until `count` connections have been accepted, or time out.
    pub async fn wait_for_connections(&self, count: usize) -> bool {
        timeout(Duration::from_secs(5), async {
            while self.connection_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Request URIs of accepted upgrades, in order.
    pub fn captured_uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }
}
