//! Transport seam: how the connection task opens, reads, and writes a socket.
//!
//! [`WsConnector`] is the production implementation. [`crate::memory`]
//! provides an in-process one for tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::types::{Error, Frame};

/// Opens transports. One call per connection attempt.
///
/// Implementations should not apply their own overall timeout; the
/// connection task bounds every call by `ClientConfig::connect_timeout`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Transport, Error>;
}

/// Write half of an open transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), Error>;
    /// Best-effort graceful close.
    async fn close(&mut self);
}

/// Read half of an open transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next data frame. `None` when the peer closed the transport, `Some(Err)`
    /// when it failed.
    async fn next_frame(&mut self) -> Option<Result<Frame, Error>>;
}

/// An open transport, split so that reads and writes can proceed
/// independently.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket (tokio-tungstenite)
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

/// Connects over WebSocket. Text frames carry payloads; binary frames are
/// accepted if they hold UTF-8 JSON. Control frames are handled by
/// tungstenite and never surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, Error> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws.split();
        Ok(Transport::new(WsSink(write), WsSource(read)))
    }
}

struct WsSink(WsWrite);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        self.0.send(tungstenite::Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            tracing::debug!("WebSocket close failed: {e}");
        }
    }
}

struct WsSource(WsRead);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, Error>> {
        loop {
            match self.0.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(Frame::Text(text.as_str().to_owned())));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    return Some(Ok(Frame::Binary(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(close)) => {
                    tracing::debug!(?close, "WebSocket close frame received");
                    return None;
                }
                Ok(_) => {
                    // Ping, pong and raw frames
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
