//! Connection management: state machine, reconnection timer, and inbound
//! frame routing.
//!
//! A single task owns everything here. Handle commands and transport
//! notifications are queued into it and processed one at a time, so state,
//! the attempt counter, and the retry deadline never see concurrent writers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::ReconnectPolicy;
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::report::{Fault, Reporter};
use crate::transport::{Connector, FrameSink, Transport};
use crate::types::{ConnectionState, Error, Frame, Payload};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Stand-in for deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, clamped instead of overflowing.
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

// ---------------------------------------------------------------------------
// Shared state cell
// ---------------------------------------------------------------------------

/// Current state plus the per-observer transition queues.
///
/// Readable from any handle; written only by [`ConnectionManager::transition`].
pub(crate) struct StateCell {
    current: watch::Sender<ConnectionState>,
    observers: Mutex<Vec<mpsc::UnboundedSender<ConnectionState>>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            current: watch::Sender::new(ConnectionState::Disconnected),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.current.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    pub(crate) fn observe(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn publish(&self, next: ConnectionState) {
        self.current.send_replace(next);
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(next).is_ok());
    }
}

// ---------------------------------------------------------------------------
// Commands and transport events
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(String),
}

/// Notifications from handshake and reader tasks, tagged with the generation
/// of the transport they belong to.
#[derive(Debug)]
enum TransportEvent {
    Handshake {
        generation: u64,
        result: Result<Transport, Error>,
    },
    Frame {
        generation: u64,
        frame: Frame,
    },
    Closed {
        generation: u64,
        reason: Option<String>,
    },
    WriteFailed {
        generation: u64,
        error: String,
    },
}

impl TransportEvent {
    fn generation(&self) -> u64 {
        match self {
            TransportEvent::Handshake { generation, .. }
            | TransportEvent::Frame { generation, .. }
            | TransportEvent::Closed { generation, .. }
            | TransportEvent::WriteFailed { generation, .. } => *generation,
        }
    }
}

/// The live transport. Each half is driven by its own task so the manager
/// never awaits the socket.
struct Link {
    outbound: mpsc::UnboundedSender<String>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionManager {
    url: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    reporter: Arc<dyn Reporter>,
    state: Arc<StateCell>,

    current: ConnectionState,
    attempt: u32,
    generation: u64,
    handshake: Option<JoinHandle<()>>,
    link: Option<Link>,
    retry_at: Option<Instant>,
    idle_deadline: Option<Instant>,

    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
        reporter: Arc<dyn Reporter>,
        state: Arc<StateCell>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            url: config.url.clone(),
            policy: config.reconnect,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            connector,
            dispatcher,
            reporter,
            current: state.get(),
            state,
            attempt: 0,
            generation: 0,
            handshake: None,
            link: None,
            retry_at: None,
            idle_deadline: None,
            events_tx,
            events_rx,
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped). Always leaves
    /// the connection disconnected on exit.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let retry_at = self.retry_at;
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("Shutdown requested");
                    break;
                }

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_due();
                }

                _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    self.idle_expired();
                }
            }
        }
        self.disconnect().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect().await,
            Command::Send(text) => self.write(text),
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        if event.generation() != self.generation {
            tracing::trace!(
                event_generation = event.generation(),
                current_generation = self.generation,
                "Discarding event from stale transport"
            );
            return;
        }
        match event {
            TransportEvent::Handshake {
                result: Ok(transport),
                ..
            } => self.opened(transport),
            TransportEvent::Handshake { result: Err(e), .. } => {
                self.handshake = None;
                self.reporter.report(&Fault::ConnectFailed {
                    attempt: self.attempt,
                    error: e.to_string(),
                });
                self.lost();
            }
            TransportEvent::Frame { frame, .. } => self.deliver(&frame),
            TransportEvent::Closed { reason, .. } => {
                self.reporter.report(&Fault::ConnectionLost { reason });
                self.lost();
            }
            TransportEvent::WriteFailed { error, .. } => {
                self.reporter.report(&Fault::SendFailed { error });
                self.lost();
            }
        }
    }

    // -- state machine ------------------------------------------------------

    fn transition(&mut self, next: ConnectionState) {
        if self.current == next {
            return;
        }
        tracing::debug!(from = %self.current, to = %next, "Connection state changed");
        self.current = next;
        self.state.publish(next);
    }

    fn connect(&mut self) {
        match self.current {
            ConnectionState::Connecting | ConnectionState::Open => {
                tracing::debug!(state = %self.current, "Connect ignored");
            }
            ConnectionState::Closed => self.begin_connect(),
            ConnectionState::Disconnected => {
                self.attempt = 0;
                self.begin_connect();
            }
        }
    }

    /// Enter `Connecting` with a fresh transport generation.
    fn begin_connect(&mut self) {
        self.retry_at = None;
        self.generation += 1;
        let generation = self.generation;
        self.transition(ConnectionState::Connecting);
        tracing::info!(url = %self.url, generation, "Connecting");

        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let timeout = self.connect_timeout;
        let events = self.events_tx.clone();
        self.handshake = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout(timeout)),
            };
            let _ = events.send(TransportEvent::Handshake { generation, result });
        }));
    }

    fn opened(&mut self, transport: Transport) {
        self.handshake = None;
        let Transport { sink, mut source } = transport;
        let generation = self.generation;
        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next_frame().await {
                    Some(Ok(frame)) => {
                        if events
                            .send(TransportEvent::Frame { generation, frame })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = events.send(TransportEvent::Closed { generation, reason });
        });
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(pump_writes(
            sink,
            queue,
            self.events_tx.clone(),
            generation,
        ));
        self.link = Some(Link {
            outbound,
            writer,
            reader,
        });
        self.attempt = 0;
        self.touch();
        tracing::info!(generation, "Connection open");
        self.transition(ConnectionState::Open);
    }

    /// The current transport failed or closed without being asked to.
    fn lost(&mut self) {
        self.drop_transport();
        self.transition(ConnectionState::Closed);

        if self.policy.should_retry(self.attempt) {
            let delay = self.policy.scheduled_delay(self.attempt);
            self.attempt += 1;
            tracing::info!(
                "Reconnecting in {delay:?} (attempt {}/{})",
                self.attempt,
                self.policy.max_attempts
            );
            self.retry_at = Some(deadline_after(delay));
        } else {
            tracing::warn!(
                "Giving up after {} reconnect attempts",
                self.policy.max_attempts
            );
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn retry_due(&mut self) {
        self.retry_at = None;
        if self.current == ConnectionState::Closed {
            self.begin_connect();
        }
    }

    fn idle_expired(&mut self) {
        self.idle_deadline = None;
        if self.current != ConnectionState::Open {
            return;
        }
        let reason = format!(
            "no inbound frame for {:?}",
            self.idle_timeout.unwrap_or_default()
        );
        self.reporter.report(&Fault::ConnectionLost {
            reason: Some(reason),
        });
        self.lost();
    }

    /// Manual teardown. Never schedules a retry.
    async fn disconnect(&mut self) {
        self.retry_at = None;
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(link) = self.link.take() {
            let Link {
                outbound,
                mut writer,
                reader,
            } = link;
            reader.abort();
            // Closing the queue lets the writer flush and close the sink.
            drop(outbound);
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                tracing::debug!("Transport close timed out");
                writer.abort();
            }
        }
        self.idle_deadline = None;
        self.generation += 1;
        self.transition(ConnectionState::Disconnected);
    }

    /// Abandon the current transport (if any) and retire its generation so
    /// late events from it are discarded.
    fn drop_transport(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(link) = self.link.take() {
            link.reader.abort();
            link.writer.abort();
        }
        self.idle_deadline = None;
        self.generation += 1;
    }

    // -- traffic ------------------------------------------------------------

    fn touch(&mut self) {
        self.idle_deadline = self.idle_timeout.map(deadline_after);
    }

    fn deliver(&mut self, frame: &Frame) {
        self.touch();
        match Payload::decode(frame) {
            Ok(payload) => self.dispatcher.dispatch(&payload),
            Err(e) => self.reporter.report(&Fault::MalformedFrame {
                error: e.to_string(),
            }),
        }
    }

    /// Hand `text` to the writer task. A failed write comes back as
    /// [`TransportEvent::WriteFailed`].
    fn write(&mut self, text: String) {
        let queued = match (self.current, self.link.as_ref()) {
            (ConnectionState::Open, Some(link)) => link.outbound.send(text).is_ok(),
            _ => false,
        };
        if !queued {
            self.reporter.report(&Fault::SendDropped);
        }
    }
}

/// Write queued texts in order, then close the sink once the queue is closed.
async fn pump_writes(
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: u64,
) {
    while let Some(text) = queue.recv().await {
        if let Err(e) = sink.send_text(text).await {
            let _ = events.send(TransportEvent::WriteFailed {
                generation,
                error: e.to_string(),
            });
            return;
        }
    }
    sink.close().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use crate::report::TracingReporter;

    struct Fixture {
        manager: ConnectionManager,
        listener: crate::memory::MemoryListener,
        state: Arc<StateCell>,
        delivered: Arc<Mutex<Vec<Payload>>>,
    }

    fn fixture(policy: ReconnectPolicy) -> Fixture {
        let (connector, listener) = MemoryConnector::pair();
        let reporter: Arc<dyn Reporter> = Arc::new(TracingReporter);
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&reporter), false));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let _unsub = dispatcher.register(Arc::new(move |p: &Payload| {
            sink.lock().unwrap().push(p.clone());
        }));
        let state = Arc::new(StateCell::new());
        let config = ClientConfig {
            reconnect: policy,
            ..ClientConfig::new("ws://backend.test/ws")
        };
        let manager = ConnectionManager::new(
            &config,
            Arc::new(connector),
            dispatcher,
            reporter,
            Arc::clone(&state),
        );
        Fixture {
            manager,
            listener,
            state,
            delivered,
        }
    }

    impl Fixture {
        /// Answer the pending handshake and feed its result to the manager.
        async fn accept(&mut self) -> crate::memory::MemoryPeer {
            let peer = self.listener.next().await.unwrap().accept();
            let event = self.manager.events_rx.recv().await.unwrap();
            self.manager.handle_event(event).await;
            peer
        }
    }

    #[tokio::test]
    async fn open_resets_attempt_counter() {
        let mut f = fixture(ReconnectPolicy::new(Duration::from_secs(1), 3));
        f.manager.attempt = 2;
        f.manager.connect();
        assert_eq!(f.manager.attempt, 0);

        f.manager.attempt = 2;
        let _peer = f.accept().await;
        assert_eq!(f.state.get(), ConnectionState::Open);
        assert_eq!(f.manager.attempt, 0);
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connecting() {
        let mut f = fixture(ReconnectPolicy::default());
        f.manager.connect();
        let generation = f.manager.generation;
        f.manager.connect();
        assert_eq!(f.manager.generation, generation);
        assert!(f.listener.next().await.is_some());
        tokio::task::yield_now().await;
        assert!(f.listener.try_next().is_none());
    }

    #[tokio::test]
    async fn unexpected_close_schedules_one_retry() {
        let mut f = fixture(ReconnectPolicy::new(Duration::from_secs(1), 3));
        f.manager.connect();
        let generation = f.manager.generation;
        let _peer = f.accept().await;

        f.manager
            .handle_event(TransportEvent::Closed {
                generation,
                reason: None,
            })
            .await;
        assert_eq!(f.state.get(), ConnectionState::Closed);
        assert_eq!(f.manager.attempt, 1);
        assert!(f.manager.retry_at.is_some());
        assert!(f.manager.link.is_none());
    }

    #[tokio::test]
    async fn stale_transport_events_are_discarded() {
        let mut f = fixture(ReconnectPolicy::new(Duration::from_secs(1), 3));

        // T1 opens, then drops unexpectedly.
        f.manager.connect();
        let first = f.manager.generation;
        let _t1 = f.accept().await;
        f.manager
            .handle_event(TransportEvent::Closed {
                generation: first,
                reason: Some("reset".to_string()),
            })
            .await;
        assert_eq!(f.state.get(), ConnectionState::Closed);

        // Retry produces T2, which opens.
        f.manager.retry_due();
        let second = f.manager.generation;
        assert_ne!(first, second);
        let _t2 = f.accept().await;
        assert_eq!(f.state.get(), ConnectionState::Open);

        // Late traffic from T1 must not reach subscribers or move state.
        f.manager
            .handle_event(TransportEvent::Frame {
                generation: first,
                frame: Frame::Text(r#"{"type":"late"}"#.to_string()),
            })
            .await;
        f.manager
            .handle_event(TransportEvent::Closed {
                generation: first,
                reason: None,
            })
            .await;
        assert!(f.delivered.lock().unwrap().is_empty());
        assert_eq!(f.state.get(), ConnectionState::Open);
        assert!(f.manager.retry_at.is_none());
        assert_eq!(f.manager.attempt, 0);

        // T2 traffic still flows.
        f.manager
            .handle_event(TransportEvent::Frame {
                generation: second,
                frame: Frame::Text(r#"{"type":"fresh"}"#.to_string()),
            })
            .await;
        let delivered = f.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind(), Some("fresh"));
    }

    #[tokio::test]
    async fn handshake_completing_after_disconnect_is_ignored() {
        let mut f = fixture(ReconnectPolicy::default());
        f.manager.connect();
        let pending = f.listener.next().await.unwrap();
        f.manager.disconnect().await;
        assert_eq!(f.state.get(), ConnectionState::Disconnected);
        // Let the runtime drop the aborted handshake task.
        tokio::task::yield_now().await;

        let peer = pending.accept();
        assert!(!peer.is_connected());
        assert!(f.manager.link.is_none());
        assert!(f.manager.retry_at.is_none());
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_retry() {
        let mut f = fixture(ReconnectPolicy::new(Duration::from_secs(1), 3));
        f.manager.connect();
        let generation = f.manager.generation;
        let _peer = f.accept().await;
        f.manager
            .handle_event(TransportEvent::Closed {
                generation,
                reason: None,
            })
            .await;
        assert!(f.manager.retry_at.is_some());

        f.manager.disconnect().await;
        assert!(f.manager.retry_at.is_none());
        assert_eq!(f.state.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn write_when_not_open_reports_drop() {
        let mut f = fixture(ReconnectPolicy::default());
        f.manager.write("{}".to_string());
        assert_eq!(f.state.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn write_is_queued_to_the_writer_task() {
        let mut f = fixture(ReconnectPolicy::default());
        f.manager.connect();
        let mut peer = f.accept().await;

        f.manager.write(r#"{"type":"a"}"#.to_string());
        f.manager.write(r#"{"type":"b"}"#.to_string());
        assert_eq!(peer.recv().await.as_deref(), Some(r#"{"type":"a"}"#));
        assert_eq!(peer.recv().await.as_deref(), Some(r#"{"type":"b"}"#));
    }

    #[tokio::test]
    async fn failed_write_is_treated_as_lost_connection() {
        let mut f = fixture(ReconnectPolicy::new(Duration::from_secs(1), 3));
        f.manager.connect();
        let generation = f.manager.generation;
        let _peer = f.accept().await;

        f.manager
            .handle_event(TransportEvent::WriteFailed {
                generation,
                error: "broken pipe".to_string(),
            })
            .await;
        assert_eq!(f.state.get(), ConnectionState::Closed);
        assert!(f.manager.retry_at.is_some());
        assert!(f.manager.link.is_none());
    }

    #[tokio::test]
    async fn write_to_vanished_peer_ends_the_connection() {
        let mut f = fixture(ReconnectPolicy::new(Duration::from_secs(1), 3));
        f.manager.connect();
        let peer = f.accept().await;
        drop(peer);

        f.manager.write(r#"{"type":"chat"}"#.to_string());
        let event = f.manager.events_rx.recv().await.unwrap();
        assert!(matches!(
            event,
            TransportEvent::WriteFailed { .. } | TransportEvent::Closed { .. }
        ));
        f.manager.handle_event(event).await;
        assert_eq!(f.state.get(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_backoff_is_clamped() {
        let mut f = fixture(ReconnectPolicy::new(Duration::MAX, 3));
        f.manager.connect();
        f.listener.next().await.unwrap().refuse("down");
        let event = f.manager.events_rx.recv().await.unwrap();
        f.manager.handle_event(event).await;

        assert_eq!(f.state.get(), ConnectionState::Closed);
        let retry_at = f.manager.retry_at.unwrap();
        assert_eq!(retry_at - Instant::now(), FAR_FUTURE);

        f.manager.disconnect().await;
        assert_eq!(f.state.get(), ConnectionState::Disconnected);
        assert!(f.manager.retry_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_after_never_overflows() {
        let now = Instant::now();
        assert_eq!(deadline_after(Duration::from_secs(3)) - now, Duration::from_secs(3));
        assert_eq!(deadline_after(Duration::MAX) - now, FAR_FUTURE);
    }

    #[test]
    fn state_cell_fans_out_every_transition() {
        let cell = StateCell::new();
        let mut a = cell.observe();
        let mut b = cell.observe();
        cell.publish(ConnectionState::Connecting);
        cell.publish(ConnectionState::Open);
        let _ = b.try_recv();
        cell.publish(ConnectionState::Closed);

        let seen: Vec<_> = std::iter::from_fn(|| a.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closed
            ]
        );
        assert_eq!(b.try_recv().ok(), Some(ConnectionState::Open));
        assert_eq!(cell.get(), ConnectionState::Closed);
    }
}
