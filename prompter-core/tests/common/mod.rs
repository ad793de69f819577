//! Shared helpers: a local websocket server and event waiting.

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerSocket = WebSocketStream<TcpStream>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Bind a listener on an ephemeral port and return it with its `ws://` URL.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("ws://{addr}/ws"))
}

pub async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client never dialled")
        .expect("accept");
    tokio_tungstenite::accept_async(stream).await.expect("handshake")
}

pub async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

/// Next text frame from the client, parsed as JSON.
pub async fn recv_json(ws: &mut ServerSocket) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("no frame from client")
            .expect("stream ended")
            .expect("read");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("client sent invalid json");
        }
    }
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
