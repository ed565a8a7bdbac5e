//! Transport seam between the connection driver and a WebSocket library.
//!
//! The driver only sees [`Socket`]: a boxed [`FrameSink`] for writes and a
//! stream of [`Frame`]s for reads. [`TungsteniteConnector`] is the default
//! implementation; tests plug in in-memory connectors.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt, stream::BoxStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::debug;

use crate::error::{ChannelError, ChannelResult};

/// An inbound data or close frame.
///
/// Control frames (ping/pong) are answered by the transport and never
/// surface here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the socket, with an optional reason.
    Close(Option<String>),
}

impl Frame {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
            Self::Close(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write half of a socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame.
    async fn send_text(&mut self, text: String) -> ChannelResult<()>;

    /// Send a close frame and shut the write half.
    async fn close(&mut self) -> ChannelResult<()>;
}

/// Read half of a socket. The stream ending means the socket is gone.
pub type FrameStream = BoxStream<'static, ChannelResult<Frame>>;

/// An open socket, split into halves.
pub struct Socket {
    pub writer: Box<dyn FrameSink>,
    pub reader: FrameStream,
}

impl Socket {
    pub fn new(writer: impl FrameSink + 'static, reader: FrameStream) -> Self {
        Self {
            writer: Box::new(writer),
            reader,
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

/// Opens sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `url`. The caller applies the connect timeout.
    async fn connect(&self, url: &str) -> ChannelResult<Socket>;
}

/// [`Connector`] backed by tokio-tungstenite, with rustls for `wss://`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> ChannelResult<Socket> {
        let (ws, response) = connect_async(url).await?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws.split();
        let reader = read
            .filter_map(|item| async move { from_tungstenite(item) })
            .boxed();

        Ok(Socket::new(TungsteniteSink { inner: write }, reader))
    }
}

fn from_tungstenite(item: Result<Message, WsError>) -> Option<ChannelResult<Frame>> {
    match item {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data.to_vec()))),
        Ok(Message::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| {
            if f.reason.as_str().is_empty() {
                u16::from(f.code).to_string()
            } else {
                format!("{}: {}", u16::from(f.code), f.reason.as_str())
            }
        })))),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        // A close handshake the peer finished is not an error for us.
        Err(WsError::ConnectionClosed) => None,
        Err(err) => Some(Err(err.into())),
    }
}

struct TungsteniteSink<S> {
    inner: S,
}

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> ChannelResult<()> {
        self.inner.send(Message::text(text)).await.map_err(ChannelError::from)
    }

    async fn close(&mut self) -> ChannelResult<()> {
        self.inner.send(Message::Close(None)).await?;
        self.inner.close().await.map_err(ChannelError::from)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connector for driver tests.

    use std::{collections::VecDeque, sync::Arc};

    use futures_util::stream::poll_fn;
    use parking_lot::Mutex;
    use tokio::{sync::mpsc, time::Instant};

    use super::*;

    /// What the client wrote to a mock socket.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum Sent {
        Text(String),
        Close,
    }

    /// The server side of one accepted mock socket.
    pub(crate) struct Peer {
        pub inbound: mpsc::UnboundedSender<ChannelResult<Frame>>,
        pub outbound: mpsc::UnboundedReceiver<Sent>,
    }

    impl Peer {
        pub fn push_text(&self, text: &str) {
            let _ = self.inbound.send(Ok(Frame::Text(text.to_string())));
        }

        /// Drain everything the client has written so far.
        pub fn sent(&mut self) -> Vec<Sent> {
            let mut out = Vec::new();
            while let Ok(item) = self.outbound.try_recv() {
                out.push(item);
            }
            out
        }
    }

    #[derive(Clone, Copy, Debug)]
    pub(crate) enum Outcome {
        Accept,
        Refuse,
        /// Never completes; exercises the connect timeout.
        Hang,
        /// Accepts after the given delay.
        Slow(std::time::Duration),
    }

    /// Connector driven by a script of outcomes. When the script runs out,
    /// `fallback` applies.
    pub(crate) struct MockConnector {
        script: Mutex<VecDeque<Outcome>>,
        fallback: Outcome,
        attempts: Mutex<Vec<Instant>>,
        peers: mpsc::UnboundedSender<Peer>,
    }

    impl MockConnector {
        pub fn new(fallback: Outcome) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                attempts: Mutex::new(Vec::new()),
                peers,
            });
            (connector, rx)
        }

        pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
            self.script.lock().extend(outcomes);
        }

        /// Virtual-clock instants at which connect was called.
        pub fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().clone()
        }
    }

    struct MockSink {
        tx: mpsc::UnboundedSender<Sent>,
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn send_text(&mut self, text: String) -> ChannelResult<()> {
            self.tx
                .send(Sent::Text(text))
                .map_err(|_| ChannelError::transport("peer gone"))
        }

        async fn close(&mut self) -> ChannelResult<()> {
            let _ = self.tx.send(Sent::Close);
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> ChannelResult<Socket> {
            self.attempts.lock().push(Instant::now());
            let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);
            match outcome {
                Outcome::Refuse => Err(ChannelError::transport("connection refused")),
                Outcome::Hang => std::future::pending().await,
                Outcome::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(self.accept())
                }
                Outcome::Accept => Ok(self.accept()),
            }
        }
    }

    impl MockConnector {
        fn accept(&self) -> Socket {
            let (in_tx, mut in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let _ = self.peers.send(Peer {
                inbound: in_tx,
                outbound: out_rx,
            });
            Socket::new(
                MockSink { tx: out_tx },
                poll_fn(move |cx| in_rx.poll_recv(cx)).boxed(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len() {
        assert_eq!(Frame::Text("abc".into()).len(), 3);
        assert_eq!(Frame::Binary(vec![0; 8]).len(), 8);
        assert!(Frame::Close(None).is_empty());
    }

    #[test]
    fn tungstenite_control_frames_are_skipped() {
        assert!(from_tungstenite(Ok(Message::Ping(Default::default()))).is_none());
        assert!(from_tungstenite(Ok(Message::Pong(Default::default()))).is_none());
        assert!(from_tungstenite(Err(WsError::ConnectionClosed)).is_none());
    }

    #[test]
    fn tungstenite_data_frames_map() {
        assert_eq!(
            from_tungstenite(Ok(Message::text("hi"))).unwrap().unwrap(),
            Frame::Text("hi".into())
        );
        assert_eq!(
            from_tungstenite(Ok(Message::binary(vec![1u8, 2])))
                .unwrap()
                .unwrap(),
            Frame::Binary(vec![1, 2])
        );
        assert_eq!(
            from_tungstenite(Ok(Message::Close(None))).unwrap().unwrap(),
            Frame::Close(None)
        );
    }
}
