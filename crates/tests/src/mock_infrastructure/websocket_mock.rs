//! Mock WebSocket backend.
//!
//! Answers every text or binary frame with one frame of the same kind built by a reply
//! function (an echo by default), records what it received, and can push unsolicited frames
//! to connected clients the way a subscription backend does.

use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

type Reply = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

pub struct MockWebSocketBackend {
    addr: SocketAddr,
    received: Arc<RwLock<Vec<Vec<u8>>>>,
    push_tx: broadcast::Sender<String>,
    server_handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockWebSocketBackend {
    /// Echo backend on a random local port.
    ///
    /// # Errors
    ///
    /// Returns an error if no local port can be bound.
    pub async fn echo() -> Result<Self, std::io::Error> {
        Self::with_reply(|frame| frame.to_vec()).await
    }

    /// Backend answering each frame with `reply(frame)`.
    ///
    /// # Errors
    ///
    /// Returns an error if no local port can be bound.
    pub async fn with_reply(
        reply: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let received = Arc::new(RwLock::new(Vec::new()));
        let (push_tx, _) = broadcast::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        let server_handle = Self::spawn_server(
            listener,
            Arc::new(reply),
            received.clone(),
            push_tx.clone(),
            shutdown_tx.subscribe(),
        );

        Ok(Self { addr, received, push_tx, server_handle, shutdown_tx })
    }

    fn spawn_server(
        listener: TcpListener,
        reply: Reply,
        received: Arc<RwLock<Vec<Vec<u8>>>>,
        push_tx: broadcast::Sender<String>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok((stream, _)) = result {
                            tokio::spawn(Self::handle_connection(
                                stream,
                                reply.clone(),
                                received.clone(),
                                push_tx.subscribe(),
                            ));
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        reply: Reply,
        received: Arc<RwLock<Vec<Vec<u8>>>>,
        mut push_rx: broadcast::Receiver<String>,
    ) {
        let Ok(ws_stream) = accept_async(stream).await else { return };
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let outbound = match msg {
                        Some(Ok(Message::Text(text))) => {
                            received.write().await.push(text.as_bytes().to_vec());
                            let answer = reply(text.as_bytes());
                            Message::Text(String::from_utf8_lossy(&answer).into_owned().into())
                        }
                        Some(Ok(Message::Binary(data))) => {
                            received.write().await.push(data.to_vec());
                            Message::Binary(reply(&data).into())
                        }
                        Some(Ok(Message::Ping(data))) => Message::Pong(data),
                        Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    if write.send(outbound).await.is_err() {
                        break;
                    }
                }
                pushed = push_rx.recv() => {
                    let Ok(text) = pushed else { continue };
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Sends `text` to every connected client without a preceding request.
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.push_tx.send(text.into());
    }

    pub async fn received(&self) -> Vec<Vec<u8>> {
        self.received.read().await.clone()
    }

    /// Waits until at least `count` frames have arrived.
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.received.read().await.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for MockWebSocketBackend {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.server_handle.abort();
    }
}
