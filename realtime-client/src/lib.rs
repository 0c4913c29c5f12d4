//! Resilient realtime WebSocket client.
//!
//! Keeps one persistent connection to a backend endpoint, fans inbound JSON
//! payloads out to any number of subscribers, and accepts outbound payloads
//! while the connection is open.
//!
//! # Features
//! - Observable connection state (`disconnected`, `connecting`, `open`, `closed`)
//! - Automatic reconnection with exponential backoff and an attempt ceiling
//! - Manual connect / disconnect; a manual disconnect never triggers a retry
//! - Subscriber isolation: a panicking handler is reported, the rest still run
//! - Pluggable transport, with an in-memory one for tests
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), realtime_client::Error> {
//! use realtime_client::{Client, ClientConfig, ConnectionState, Payload};
//!
//! let client = Client::start(ClientConfig::from_env()?)?;
//! let _sub = client.subscribe(|payload| {
//!     println!("got: {:?}", payload.kind());
//! });
//!
//! let mut changes = client.state_changes();
//! while let Some(state) = changes.next().await {
//!     if state == ConnectionState::Open {
//!         client.send(&Payload::of_type("chat").with("body", "hello"));
//!         break;
//!     }
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod config;
mod connection;
mod dispatch;
pub mod memory;
mod report;
mod transport;
mod types;

pub use backoff::ReconnectPolicy;
pub use client::{Client, ClientBuilder, Handle, StateChanges};
pub use config::{ClientConfig, ConfigError, DEFAULT_URL, URL_ENV};
pub use dispatch::{Handler, SubscriberId, Unsubscribe};
pub use report::{Fault, Reporter, TracingReporter};
pub use transport::{Connector, FrameSink, FrameSource, Transport, WsConnector};
pub use types::{ConnectionState, Error, Frame, Payload};
