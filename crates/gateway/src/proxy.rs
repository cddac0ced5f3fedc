//! Bidirectional WebSocket relay between the browser and a workspace pod.
//!
//! The client side arrives already upgraded by axum; the backend side is
//! dialed with tokio-tungstenite under a hard deadline. Two relay tasks run
//! per connection, one per direction, so frames from one endpoint stay in
//! order. The first error or close on either side ends the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{self, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

use devplane_api::names;

/// Ceiling for the client-side upgrade handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard deadline for dialing the workspace's terminal endpoint.
pub const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback invoked after each successfully forwarded frame.
pub type ActivityFn = Arc<dyn Fn() + Send + Sync>;

type Backend = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("dial backend {0:?}: timed out")]
    DialTimeout(String),
    #[error("dial backend {url:?}: {source}")]
    Dial {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// WebSocket URL of a workspace's terminal.
pub fn backend_ws_url(service_endpoint: &str) -> String {
    format!("ws://{service_endpoint}:{}", names::TTYD_PORT)
}

/// Plain-HTTP URL of the same terminal, for the catch-all proxy.
pub fn backend_http_url(service_endpoint: &str) -> String {
    format!("http://{service_endpoint}:{}", names::TTYD_PORT)
}

/// Whether the upgrade handshake blew its deadline. `started` is when the
/// switching response was issued; `now` is when the upgraded socket arrived.
pub fn handshake_expired(started: Instant, now: Instant) -> bool {
    now.duration_since(started) > HANDSHAKE_TIMEOUT
}

/// Relays frames between `client` and the backend at `backend_url` until
/// either side closes or errors. `on_activity` fires after each forwarded
/// frame; pass `None` to disable activity tracking.
pub async fn serve_ws(
    client: WebSocket,
    backend_url: &str,
    on_activity: Option<ActivityFn>,
) -> Result<(), ProxyError> {
    let (backend, _response) =
        tokio::time::timeout(BACKEND_DIAL_TIMEOUT, tokio_tungstenite::connect_async(backend_url))
            .await
            .map_err(|_| ProxyError::DialTimeout(backend_url.to_string()))?
            .map_err(|source| ProxyError::Dial {
                url: backend_url.to_string(),
                source,
            })?;

    info!(backend = backend_url, "WebSocket tunnel open");

    let (client_tx, client_rx) = client.split();
    let (backend_tx, backend_rx) = backend.split();

    // Buffered so whichever relay finishes second never blocks on report.
    let (done_tx, mut done_rx) = mpsc::channel::<String>(2);

    tokio::spawn(relay_client_to_backend(
        client_rx,
        backend_tx,
        done_tx.clone(),
        on_activity.clone(),
    ));
    tokio::spawn(relay_backend_to_client(
        backend_rx,
        client_tx,
        done_tx,
        on_activity,
    ));

    // The first relay to finish names the reason the tunnel ended.
    let reason = done_rx.recv().await.unwrap_or_default();
    info!(backend = backend_url, reason, "WebSocket tunnel closed");
    Ok(())
}

async fn relay_client_to_backend(
    mut client_rx: SplitStream<WebSocket>,
    mut backend_tx: SplitSink<Backend, BackendMessage>,
    done: mpsc::Sender<String>,
    on_activity: Option<ActivityFn>,
) {
    loop {
        match client_rx.next().await {
            Some(Ok(message)) => {
                let closing = matches!(message, ws::Message::Close(_));
                if backend_tx.send(client_to_backend(message)).await.is_err() {
                    let _ = done.try_send("backend write failed".to_string());
                    return;
                }
                if closing {
                    let _ = done.try_send("client closed".to_string());
                    return;
                }
                if let Some(notify) = &on_activity {
                    notify();
                }
            }
            Some(Err(error)) => {
                let _ = backend_tx.send(BackendMessage::Close(None)).await;
                let _ = done.try_send(format!("client read: {error}"));
                return;
            }
            None => {
                let _ = backend_tx.send(BackendMessage::Close(None)).await;
                let _ = done.try_send("client disconnected".to_string());
                return;
            }
        }
    }
}

async fn relay_backend_to_client(
    mut backend_rx: SplitStream<Backend>,
    mut client_tx: SplitSink<WebSocket, ws::Message>,
    done: mpsc::Sender<String>,
    on_activity: Option<ActivityFn>,
) {
    loop {
        match backend_rx.next().await {
            Some(Ok(message)) => {
                let closing = matches!(message, BackendMessage::Close(_));
                let Some(message) = backend_to_client(message) else {
                    continue;
                };
                if client_tx.send(message).await.is_err() {
                    let _ = done.try_send("client write failed".to_string());
                    return;
                }
                if closing {
                    let _ = done.try_send("backend closed".to_string());
                    return;
                }
                if let Some(notify) = &on_activity {
                    notify();
                }
            }
            Some(Err(error)) => {
                let _ = client_tx.send(ws::Message::Close(None)).await;
                let _ = done.try_send(format!("backend read: {error}"));
                return;
            }
            None => {
                let _ = client_tx.send(ws::Message::Close(None)).await;
                let _ = done.try_send("backend disconnected".to_string());
                return;
            }
        }
    }
}

fn client_to_backend(message: ws::Message) -> BackendMessage {
    match message {
        ws::Message::Text(text) => BackendMessage::Text(text),
        ws::Message::Binary(data) => BackendMessage::Binary(data),
        ws::Message::Ping(data) => BackendMessage::Ping(data),
        ws::Message::Pong(data) => BackendMessage::Pong(data),
        ws::Message::Close(frame) => BackendMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        })),
    }
}

/// Raw intermediate frames never surface from a read, so they map to `None`.
fn backend_to_client(message: BackendMessage) -> Option<ws::Message> {
    match message {
        BackendMessage::Text(text) => Some(ws::Message::Text(text)),
        BackendMessage::Binary(data) => Some(ws::Message::Binary(data)),
        BackendMessage::Ping(data) => Some(ws::Message::Ping(data)),
        BackendMessage::Pong(data) => Some(ws::Message::Pong(data)),
        BackendMessage::Close(frame) => {
            Some(ws::Message::Close(frame.map(|f| ws::CloseFrame {
                code: f.code.into(),
                reason: f.reason,
            })))
        }
        BackendMessage::Frame(_) => None,
    }
}
