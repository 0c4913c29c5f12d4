//! Observability hook for failures that are handled locally.

use crate::dispatch::SubscriberId;

/// A failure the client absorbed without surfacing it to a caller.
///
/// Faults that change connection viability (`ConnectFailed`,
/// `ConnectionLost`) are reported in addition to the state transition they
/// cause; the others never affect connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Fault {
    /// A connection attempt failed or timed out before the handshake completed.
    ConnectFailed { attempt: u32, error: String },
    /// An open transport ended without a manual disconnect.
    ConnectionLost { reason: Option<String> },
    /// An inbound frame could not be decoded into a payload and was dropped.
    MalformedFrame { error: String },
    /// A subscriber panicked while handling a payload.
    HandlerPanicked {
        subscriber: SubscriberId,
        message: String,
    },
    /// Writing an accepted payload to the transport failed.
    SendFailed { error: String },
    /// A payload accepted while open was dropped because the connection left
    /// the open state before it could be written.
    SendDropped,
}

/// Receives [`Fault`]s. Install one with
/// [`ClientBuilder::reporter`](crate::ClientBuilder::reporter).
///
/// Closures `Fn(&Fault)` implement this trait.
pub trait Reporter: Send + Sync + 'static {
    fn report(&self, fault: &Fault);
}

impl<F> Reporter for F
where
    F: Fn(&Fault) + Send + Sync + 'static,
{
    fn report(&self, fault: &Fault) {
        (self)(fault)
    }
}

/// Default reporter: logs every fault through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, fault: &Fault) {
        match fault {
            Fault::ConnectFailed { attempt, error } => {
                tracing::warn!(attempt, "Connection attempt failed: {error}");
            }
            Fault::ConnectionLost { reason } => {
                tracing::warn!(
                    reason = reason.as_deref().unwrap_or("peer closed"),
                    "Connection lost"
                );
            }
            Fault::MalformedFrame { error } => {
                tracing::warn!("Dropping malformed frame: {error}");
            }
            Fault::HandlerPanicked {
                subscriber,
                message,
            } => {
                tracing::error!(%subscriber, "Subscriber panicked: {message}");
            }
            Fault::SendFailed { error } => {
                tracing::warn!("Failed to write payload: {error}");
            }
            Fault::SendDropped => {
                tracing::warn!("Payload dropped: connection left open state before write");
            }
        }
    }
}
