//! Public entry point: [`Client`] and the cloneable [`Handle`].

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::connection::{Command, ConnectionManager, StateCell};
use crate::dispatch::{Dispatcher, Handler, Unsubscribe};
use crate::report::{Reporter, TracingReporter};
use crate::transport::{Connector, WsConnector};
use crate::types::{ConnectionState, Error, Payload};

/// Owns the background connection task.
///
/// Dereferences to [`Handle`], so the whole consumer API is available on the
/// client itself. Dropping the client disconnects; no transport or retry
/// timer outlives it.
pub struct Client {
    handle: Handle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Client {
    /// Start a client over WebSocket with the default [`TracingReporter`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ClientConfig) -> Result<Client, Error> {
        Self::builder(config).start()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: None,
            reporter: None,
        }
    }

    /// A cheap, cloneable handle to hand to consumers.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop the connection task without waiting for it.
    pub fn close(mut self) {
        self.signal_shutdown();
    }

    /// Stop the connection task and wait until the transport is torn down.
    pub async fn shutdown(mut self) {
        self.signal_shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Connection task ended abnormally: {e}");
            }
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Deref for Client {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.handle.status())
            .finish_non_exhaustive()
    }
}

/// Configures collaborators before starting a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl ClientBuilder {
    /// Replace the WebSocket transport, e.g. with
    /// [`MemoryConnector`](crate::memory::MemoryConnector).
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Receive locally handled faults instead of logging them.
    pub fn reporter(mut self, reporter: impl Reporter) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Validate the configuration and spawn the connection task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Client, Error> {
        self.config.validate()?;

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WsConnector),
        };
        let reporter: Arc<dyn Reporter> = match self.reporter {
            Some(reporter) => reporter,
            None => Arc::new(TracingReporter),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&reporter),
            self.config.keep_history,
        ));
        let state = Arc::new(StateCell::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let manager = ConnectionManager::new(
            &self.config,
            connector,
            Arc::clone(&dispatcher),
            reporter,
            Arc::clone(&state),
        );
        let task = tokio::spawn(manager.run(commands_rx, shutdown_rx));

        let handle = Handle {
            commands: commands_tx,
            dispatcher,
            state,
        };
        if self.config.auto_connect {
            handle.connect();
        }
        tracing::debug!(url = %self.config.url, "Client started");

        Ok(Client {
            handle,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Consumer-facing API. Clones share the same connection.
#[derive(Clone)]
pub struct Handle {
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<StateCell>,
}

impl Handle {
    pub fn status(&self) -> ConnectionState {
        self.state.get()
    }

    /// Observer of the latest state. Intermediate states may be skipped; use
    /// [`state_changes`](Self::state_changes) to see every transition.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    /// Every transition from now on, in order.
    pub fn state_changes(&self) -> StateChanges {
        StateChanges {
            rx: self.state.observe(),
        }
    }

    /// Queue `payload` for writing.
    ///
    /// Returns `false`, and sends nothing, unless the connection is open.
    /// Payloads are never buffered across reconnects.
    pub fn send(&self, payload: &Payload) -> bool {
        if self.status() != ConnectionState::Open {
            tracing::debug!(state = %self.status(), "Send rejected: connection not open");
            return false;
        }
        let text = match payload.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Send rejected: {e}");
                return false;
            }
        };
        self.commands.send(Command::Send(text)).is_ok()
    }

    /// Register a callback for every inbound payload.
    pub fn subscribe<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.dispatcher.register(Arc::new(f))
    }

    /// Register a shared handler. Registering the same `Arc` again returns a
    /// capability for the existing registration.
    pub fn subscribe_handler(&self, handler: Handler) -> Unsubscribe {
        self.dispatcher.register(handler)
    }

    /// Connect if idle. No-op while connecting or open; skips a pending
    /// retry delay when closed.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the transport and cancel any pending retry.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Inbound payloads seen so far. Empty unless
    /// [`ClientConfig::keep_history`] is set.
    pub fn history(&self) -> Vec<Payload> {
        self.dispatcher.history()
    }

    pub fn subscriber_count(&self) -> usize {
        self.dispatcher.subscriber_count()
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            tracing::debug!("Connection task has exited; command ignored");
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Ordered stream of state transitions from [`Handle::state_changes`].
#[derive(Debug)]
pub struct StateChanges {
    rx: mpsc::UnboundedReceiver<ConnectionState>,
}

impl StateChanges {
    /// Next transition. `None` once the client and every handle are gone.
    pub async fn next(&mut self) -> Option<ConnectionState> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<ConnectionState> {
        self.rx.try_recv().ok()
    }
}
