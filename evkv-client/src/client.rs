//! # Client Facade
//!
//! Composition root: spawns the connection context for one client and
//! manufactures requests bound to it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::{ClientEvent, ConnectionState, ConnectionStateMachine, Event, SharedState};
use crate::error::{ClientError, ClientResult};
use crate::request::Request;
use crate::transport::{TcpTransport, Transport};

/// Event-driven key-value client with automatic reconnection.
///
/// Dropping the client tears down its connection and stops reconnecting.
/// Requests that outlive it receive [`RequestEvent::Error`](crate::RequestEvent::Error).
pub struct Client {
    shared: Arc<SharedState>,
    queue: mpsc::UnboundedSender<Event>,
    notify: broadcast::Sender<ClientEvent>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    /// Creates a client over TCP with default settings.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new() -> Self {
        Client::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let transport = TcpTransport::from_config(&config);
        Client::with_transport(config, transport)
    }

    /// Creates a client over a custom transport.
    pub fn with_transport<T: Transport>(config: ClientConfig, transport: T) -> Self {
        let shared = Arc::new(SharedState::new());
        let (notify, _) = broadcast::channel(config.event_capacity.max(1));
        let (queue, events) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let machine = ConnectionStateMachine::new(
            config,
            transport,
            Arc::clone(&shared),
            notify.clone(),
            queue.downgrade(),
        );
        tokio::spawn(machine.run(events));

        Client {
            shared,
            queue,
            notify,
        }
    }

    /// Starts the connection lifecycle. Allowed once per client.
    pub fn connect_to_server(&self, host: impl Into<String>, port: u16) -> ClientResult<()> {
        if !self.shared.activate() {
            return Err(ClientError::AlreadyActive);
        }
        self.shared.mark_started();

        let host = host.into();
        debug!(%host, port, "connect requested");
        self.queue
            .send(Event::ConnectToServer { host, port })
            .map_err(|_| ClientError::Stopped)
    }

    pub fn create_request(&self) -> Request {
        Request::new(self.queue.clone())
    }

    /// Subscribes to `Connected` / `Disconnected` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.notify.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Time since `connect_to_server`.
    pub fn elapsed(&self) -> Duration {
        self.shared.elapsed()
    }

    /// Successful connections so far, reconnects included.
    pub fn connects(&self) -> u64 {
        self.shared.connects()
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.shared.reconnect_attempts()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.queue.send(Event::Shutdown);
    }
}
