//! In-process transport for exercising the client without a network.
//!
//! Every connection attempt made through a [`MemoryConnector`] surfaces on the
//! paired [`MemoryListener`] as a [`PendingConnection`]. The test decides its
//! fate: [`accept`](PendingConnection::accept) it (yielding a [`MemoryPeer`]
//! that plays the server), [`refuse`](PendingConnection::refuse) it, or keep
//! it pending to model a handshake that never completes.
//!
//! ```
//! # async fn example() {
//! use realtime_client::memory::MemoryConnector;
//! use realtime_client::{Client, ClientConfig};
//!
//! let (connector, mut listener) = MemoryConnector::pair();
//! let client = Client::builder(ClientConfig::new("ws://backend.test/ws"))
//!     .connector(connector)
//!     .start()
//!     .unwrap();
//!
//! let peer = listener.next().await.unwrap().accept();
//! peer.send_text(r#"{"type":"hello"}"#);
//! # drop(client);
//! # }
//! ```

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::transport::{Connector, FrameSink, FrameSource, Transport};
use crate::types::{Error, Frame};

/// Client side of the in-memory transport.
pub struct MemoryConnector {
    requests: mpsc::UnboundedSender<PendingConnection>,
}

/// Server side: yields one [`PendingConnection`] per attempt.
pub struct MemoryListener {
    requests: mpsc::UnboundedReceiver<PendingConnection>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector { requests: tx },
            MemoryListener { requests: rx },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Transport, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingConnection {
            url: url.to_string(),
            requested_at: Instant::now(),
            reply: reply_tx,
        };
        self.requests
            .send(pending)
            .map_err(|_| Error::Refused("listener dropped".to_string()))?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Refused("connection dropped unanswered".to_string())),
        }
    }
}

impl MemoryListener {
    /// Wait for the next connection attempt.
    pub async fn next(&mut self) -> Option<PendingConnection> {
        self.requests.recv().await
    }

    /// The next attempt if one is already queued.
    pub fn try_next(&mut self) -> Option<PendingConnection> {
        self.requests.try_recv().ok()
    }
}

/// A connection attempt awaiting a verdict. Dropping it refuses the attempt.
#[derive(Debug)]
pub struct PendingConnection {
    url: String,
    requested_at: Instant,
    reply: oneshot::Sender<Result<Transport, Error>>,
}

impl PendingConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// When the client started this attempt.
    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    /// Complete the handshake. If the client has already abandoned the
    /// attempt, the returned peer is disconnected from the start.
    pub fn accept(self) -> MemoryPeer {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(
            MemorySink {
                outbound: Some(outbound_tx),
            },
            MemorySource {
                inbound: inbound_rx,
            },
        );
        if self.reply.send(Ok(transport)).is_err() {
            tracing::debug!(url = %self.url, "Accepted a connection the client abandoned");
        }
        MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        }
    }

    /// Fail the handshake.
    pub fn refuse(self, reason: &str) {
        let _ = self.reply.send(Err(Error::Refused(reason.to_string())));
    }
}

enum Inbound {
    Frame(Frame),
    Fail(String),
}

/// The server end of an accepted in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Send a text frame to the client. Returns `false` if the client side is
    /// gone.
    pub fn send_text(&self, text: &str) -> bool {
        self.push(Inbound::Frame(Frame::Text(text.to_string())))
    }

    pub fn send_binary(&self, data: &[u8]) -> bool {
        self.push(Inbound::Frame(Frame::Binary(data.to_vec())))
    }

    /// Make the client's next read fail with a transport error.
    pub fn fail(&mut self, reason: &str) {
        self.push(Inbound::Fail(reason.to_string()));
        self.inbound = None;
    }

    /// Close the connection from the server side.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Whether the client still holds the read half of this connection.
    pub fn is_connected(&self) -> bool {
        self.inbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Next text frame written by the client, or `None` once the client has
    /// closed its write half.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    fn push(&self, item: Inbound) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }
}

struct MemorySink {
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        match &self.outbound {
            Some(tx) => tx.send(text).map_err(|_| Error::TransportClosed),
            None => Err(Error::TransportClosed),
        }
    }

    async fn close(&mut self) {
        self.outbound = None;
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame, Error>> {
        match self.inbound.recv().await? {
            Inbound::Frame(frame) => Some(Ok(frame)),
            Inbound::Fail(reason) => Some(Err(Error::TransportFailed(reason))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dial(connector: MemoryConnector) -> tokio::task::JoinHandle<Result<Transport, Error>> {
        tokio::spawn(async move { connector.connect("ws://backend.test/ws").await })
    }

    #[tokio::test]
    async fn refused_attempt_carries_the_reason() {
        let (connector, mut listener) = MemoryConnector::pair();
        let attempt = dial(connector);

        let pending = listener.next().await.unwrap();
        assert_eq!(pending.url(), "ws://backend.test/ws");
        pending.refuse("maintenance");

        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Refused(reason) if reason == "maintenance"));
    }

    #[tokio::test]
    async fn dropped_pending_connection_refuses() {
        let (connector, mut listener) = MemoryConnector::pair();
        let attempt = dial(connector);

        drop(listener.next().await.unwrap());
        assert!(matches!(attempt.await.unwrap(), Err(Error::Refused(_))));
    }

    #[tokio::test]
    async fn dropped_listener_refuses_immediately() {
        let (connector, listener) = MemoryConnector::pair();
        drop(listener);
        let result = connector.connect("ws://backend.test/ws").await;
        assert!(matches!(result, Err(Error::Refused(_))));
    }

    #[tokio::test]
    async fn accepted_connection_carries_frames_both_ways() {
        let (connector, mut listener) = MemoryConnector::pair();
        let attempt = dial(connector);
        let mut peer = listener.next().await.unwrap().accept();
        let Transport {
            mut sink,
            mut source,
        } = attempt.await.unwrap().unwrap();
        assert!(peer.is_connected());

        assert!(peer.send_text(r#"{"type":"hello"}"#));
        assert!(peer.send_binary(b"{}"));
        assert_eq!(
            source.next_frame().await.unwrap().unwrap(),
            Frame::Text(r#"{"type":"hello"}"#.to_string())
        );
        assert_eq!(
            source.next_frame().await.unwrap().unwrap(),
            Frame::Binary(b"{}".to_vec())
        );

        sink.send_text("ping".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("ping"));

        sink.close().await;
        assert_eq!(peer.recv().await, None);
        assert!(matches!(
            sink.send_text("late".to_string()).await,
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn hang_up_ends_the_read_half() {
        let (connector, mut listener) = MemoryConnector::pair();
        let attempt = dial(connector);
        let mut peer = listener.next().await.unwrap().accept();
        let mut transport = attempt.await.unwrap().unwrap();

        peer.hang_up();
        assert!(!peer.is_connected());
        assert!(!peer.send_text("{}"));
        assert!(transport.source.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn fail_surfaces_a_transport_error() {
        let (connector, mut listener) = MemoryConnector::pair();
        let attempt = dial(connector);
        let mut peer = listener.next().await.unwrap().accept();
        let mut transport = attempt.await.unwrap().unwrap();

        peer.fail("reset");
        let next = transport.source.next_frame().await;
        assert!(matches!(next, Some(Err(Error::TransportFailed(reason))) if reason == "reset"));
        assert!(transport.source.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn peer_sees_client_drop_its_read_half() {
        let (connector, mut listener) = MemoryConnector::pair();
        let attempt = dial(connector);
        let peer = listener.next().await.unwrap().accept();
        let transport = attempt.await.unwrap().unwrap();
        assert!(peer.is_connected());

        drop(transport);
        assert!(!peer.is_connected());
        assert!(!peer.send_text("{}"));
    }
}
