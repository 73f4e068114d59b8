//! # Connection State Machine
//!
//! Purpose: Own the single live transport handle of a client, drive
//! connect → connected → lost → wait → connect, and run every state change
//! of the client and its requests on one task.
//!
//! ## Design Principles
//! 1. **Single Owning Context**: One Tokio task consumes a run queue; transport
//!    callbacks and request submissions are messages on that queue.
//! 2. **Retire Before Retry**: A failed or lost handle is closed and removed
//!    from the registry before the reconnect timer is armed, so a client
//!    never has two live handles.
//! 3. **Stale Events Are Noise**: Reports naming a handle other than the live
//!    one are logged and dropped.
//! 4. **Fixed Delay**: Reconnect is single-shot after a constant delay, with
//!    no growth, no jitter and no attempt limit.
//!
//! ## State Flow
//!
//! ```text
//! Idle --connect_to_server--> Connecting --Connect(Ok)--> Connected
//!                               |   ^                        |
//!                  Connect(Err) |   | timer                  | Disconnect(Err)
//!                  open() Err   v   |                        v
//!                           ReconnectWaiting <-------- (emit disconnected)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use evkv_common::Reply;

use crate::config::ClientConfig;
use crate::registry::{registry, HandleId};
use crate::request::{self, RequestInner};
use crate::token::CompletionToken;
use crate::transport::{Session, SessionCallbacks, Status, Transport};

/// Observable phase of the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect_to_server` not called yet, or the client shut down.
    Idle,
    /// A handle is open and waiting for its connect callback.
    Connecting,
    /// The live handle accepts commands.
    Connected,
    /// No handle; the reconnect timer is armed.
    ReconnectWaiting,
}

/// Notifications broadcast by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection was established. Fires once per successful connect.
    Connected,
    /// An established connection was lost. A reconnect is already scheduled.
    Disconnected,
}

/// Messages on the owning context's run queue.
pub(crate) enum Event {
    ConnectToServer { host: String, port: u16 },
    Connect { handle: HandleId, status: Status },
    Disconnect { handle: HandleId, status: Status },
    Submit(Weak<RequestInner>),
    Completion {
        token: CompletionToken,
        reply: Option<Reply>,
        last: bool,
    },
    Shutdown,
}

/// State shared between the facade and the owning context.
///
/// `active` is the single lifecycle flag: the facade raises it once in
/// `connect_to_server`, the owning context reads it before arming a
/// reconnect and lowers it on shutdown.
pub(crate) struct SharedState {
    active: AtomicBool,
    state: AtomicU8,
    connects: AtomicU64,
    reconnect_attempts: AtomicU64,
    started: OnceLock<std::time::Instant>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        SharedState {
            active: AtomicBool::new(false),
            state: AtomicU8::new(Self::encode_state(ConnectionState::Idle)),
            connects: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            started: OnceLock::new(),
        }
    }

    /// Raises the lifecycle flag; false if it was already up.
    pub(crate) fn activate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        Self::decode_state(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(Self::encode_state(state), Ordering::Release);
    }

    pub(crate) fn connects(&self) -> u64 {
        self.connects.load(Ordering::Acquire)
    }

    pub(crate) fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) {
        let _ = self.started.set(std::time::Instant::now());
    }

    /// Time since `connect_to_server`, zero before it.
    pub(crate) fn elapsed(&self) -> Duration {
        self.started
            .get()
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    fn encode_state(state: ConnectionState) -> u8 {
        match state {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::ReconnectWaiting => 3,
        }
    }

    fn decode_state(encoded: u8) -> ConnectionState {
        match encoded {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::ReconnectWaiting,
        }
    }
}

struct LiveHandle {
    id: HandleId,
    session: Box<dyn Session>,
    connected: bool,
}

pub(crate) struct ConnectionStateMachine {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<SharedState>,
    notify: broadcast::Sender<ClientEvent>,
    // Weak so the task ends once every client, request and token is gone.
    queue: WeakUnboundedSender<Event>,
    host: String,
    port: u16,
    stopped: bool,
    live: Option<LiveHandle>,
    retiring: Option<HandleId>,
    reconnect_at: Option<Instant>,
    // Requests waiting for the next `connected`; each fires once.
    awaiting: Vec<Weak<RequestInner>>,
}

impl ConnectionStateMachine {
    pub(crate) fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        shared: Arc<SharedState>,
        notify: broadcast::Sender<ClientEvent>,
        queue: WeakUnboundedSender<Event>,
    ) -> Self {
        ConnectionStateMachine {
            config,
            transport,
            shared,
            notify,
            queue,
            host: String::new(),
            port: 0,
            stopped: false,
            live: None,
            retiring: None,
            reconnect_at: None,
            awaiting: Vec::new(),
        }
    }

    /// Runs the owning context until every sender of the run queue is gone.
    pub(crate) async fn run(mut self, mut events: UnboundedReceiver<Event>) {
        loop {
            let event = match self.reconnect_at {
                Some(deadline) => tokio::select! {
                    event = events.recv() => event,
                    _ = time::sleep_until(deadline) => {
                        self.reconnect_timeout();
                        continue;
                    }
                },
                None => events.recv().await,
            };

            match event {
                Some(event) => self.handle(event),
                None => break,
            }
        }

        self.retire_live();
        trace!("connection context stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::ConnectToServer { host, port } => self.connect_to_server(host, port),
            Event::Connect { handle, status } => self.handle_connect(handle, status),
            Event::Disconnect { handle, status } => self.handle_disconnect(handle, status),
            Event::Submit(request) => self.submit(request),
            Event::Completion { token, reply, last } => request::deliver(token, reply, last),
            Event::Shutdown => self.shutdown(),
        }
    }

    fn connect_to_server(&mut self, host: String, port: u16) {
        // The facade raised `active` and rejected any second call.
        if self.stopped {
            return;
        }

        self.host = host;
        self.port = port;
        info!(host = %self.host, port = self.port, "connecting to server");
        self.do_connect();
    }

    fn do_connect(&mut self) {
        debug_assert!(self.live.is_none() && self.retiring.is_none());
        let queue = match self.queue.upgrade() {
            Some(queue) => queue,
            None => return,
        };

        let handle = HandleId::next();
        registry().insert(handle, queue);
        self.set_state(ConnectionState::Connecting);

        match self
            .transport
            .open(&self.host, self.port, SessionCallbacks::new(handle))
        {
            Ok(session) => {
                debug!(handle = %handle, elapsed = ?self.shared.elapsed(), "handle opened");
                self.live = Some(LiveHandle {
                    id: handle,
                    session,
                    connected: false,
                });
            }
            Err(err) => {
                warn!(handle = %handle, error = %err, "open failed immediately");
                self.retiring = Some(handle);
                self.retire_live();
                self.arm_reconnect();
            }
        }
    }

    fn handle_connect(&mut self, handle: HandleId, status: Status) {
        if !self.is_live(handle) {
            trace!(handle = %handle, "connect report for a retired handle");
            return;
        }

        match status {
            Status::Ok => {
                if let Some(live) = self.live.as_mut() {
                    if live.connected {
                        return;
                    }
                    live.connected = true;
                }
                self.shared.connects.fetch_add(1, Ordering::AcqRel);
                self.set_state(ConnectionState::Connected);
                info!(handle = %handle, elapsed = ?self.shared.elapsed(), "connected");

                let _ = self.notify.send(ClientEvent::Connected);
                self.flush_awaiting();
            }
            Status::Err => {
                // Never connected: no `disconnected` notification.
                warn!(handle = %handle, elapsed = ?self.shared.elapsed(), "connect failed");
                self.retire_live();
                self.arm_reconnect();
            }
        }
    }

    fn handle_disconnect(&mut self, handle: HandleId, status: Status) {
        if status == Status::Ok || !self.is_live(handle) {
            trace!(handle = %handle, ?status, "ignoring disconnect report");
            return;
        }

        warn!(handle = %handle, elapsed = ?self.shared.elapsed(), "connection lost");
        self.retire_live();
        self.arm_reconnect();
        let _ = self.notify.send(ClientEvent::Disconnected);
    }

    fn reconnect_timeout(&mut self) {
        self.reconnect_at = None;
        if !self.shared.is_active() {
            return;
        }
        let attempt = self.shared.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(attempt, elapsed = ?self.shared.elapsed(), "reconnecting");
        self.do_connect();
    }

    /// Hands a started request its handle, or parks it until `connected`.
    fn submit(&mut self, request: Weak<RequestInner>) {
        let request = match request.upgrade() {
            Some(request) => request,
            None => {
                trace!("request released before submission");
                return;
            }
        };

        if self.stopped {
            request.fail();
            return;
        }
        let queue = match self.queue.upgrade() {
            Some(queue) => queue,
            None => return,
        };

        match self.live.as_mut().filter(|live| live.connected) {
            Some(live) => request.send_command(live.session.as_mut(), &queue),
            None => {
                request.await_connection();
                self.awaiting.push(Arc::downgrade(&request));
            }
        }
    }

    fn flush_awaiting(&mut self) {
        let awaiting = std::mem::take(&mut self.awaiting);
        if !awaiting.is_empty() {
            debug!(count = awaiting.len(), "submitting requests parked for connection");
        }
        for request in awaiting {
            self.submit(request);
        }
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.deactivate();
        self.reconnect_at = None;
        self.retire_live();
        self.set_state(ConnectionState::Idle);

        for request in std::mem::take(&mut self.awaiting) {
            if let Some(request) = request.upgrade() {
                request.fail();
            }
        }
        info!(elapsed = ?self.shared.elapsed(), "client shut down");
    }

    /// Closes the live handle, then deregisters and discards it.
    fn retire_live(&mut self) {
        if let Some(mut live) = self.live.take() {
            self.retiring = Some(live.id);
            live.session.close();
        }
        if let Some(handle) = self.retiring.take() {
            registry().remove(handle);
            trace!(handle = %handle, "handle discarded");
        }
    }

    fn arm_reconnect(&mut self) {
        if self.stopped || !self.shared.is_active() {
            return;
        }
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        self.set_state(ConnectionState::ReconnectWaiting);
        debug!(delay = ?self.config.reconnect_delay, "reconnect scheduled");
    }

    fn is_live(&self, handle: HandleId) -> bool {
        self.live.as_ref().is_some_and(|live| live.id == handle)
    }

    fn set_state(&mut self, state: ConnectionState) {
        trace!(from = ?self.shared.state(), to = ?state, "state transition");
        self.shared.set_state(state);
    }
}
