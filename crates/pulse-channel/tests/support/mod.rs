#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use pulse_channel::{Event, EventName, EventStream};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{Request, Response},
    },
};

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Handle to a local WebSocket server.
pub struct TestServer {
    pub url: String,
    pub connections: Arc<AtomicU64>,
    /// Request URIs seen during handshakes, in order.
    pub uris: mpsc::UnboundedReceiver<String>,
}

impl TestServer {
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Start a server on `127.0.0.1:0`. `session` runs once per accepted
/// socket and receives the 1-based connection number.
pub async fn start_server<F, Fut>(session: F) -> std::io::Result<TestServer>
where
    F: Fn(u64, ServerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicU64::new(0));
    let (uri_tx, uris) = mpsc::unbounded_channel();
    let session = Arc::new(session);

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };

            let session = Arc::clone(&session);
            let counter = Arc::clone(&counter);
            let uri_tx = uri_tx.clone();
            tokio::spawn(async move {
                let record_uri = |req: &Request, resp: Response| {
                    let _ = uri_tx.send(req.uri().to_string());
                    Ok(resp)
                };
                let ws = match accept_hdr_async(stream, record_uri).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let id = counter.fetch_add(1, Ordering::SeqCst) + 1;
                session(id, ws).await;
            });
        }
    });

    Ok(TestServer {
        url: format!("ws://{addr}/ws"),
        connections,
        uris,
    })
}

/// Read until the peer goes away, forwarding text frames.
pub async fn forward_texts(mut ws: ServerSocket, tx: mpsc::UnboundedSender<String>) {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            let _ = tx.send(text.as_str().to_owned());
        }
    }
}

/// Send one text frame.
pub async fn send_text(ws: &mut ServerSocket, text: &str) {
    ws.send(Message::text(text.to_string()))
        .await
        .expect("server send");
}

/// A URL to a port nobody listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("ws://{addr}/ws")
}

pub async fn wait_for(stream: &mut EventStream, name: EventName) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
            .expect("event stream closed");
        if event.name() == name {
            return event;
        }
    }
}
