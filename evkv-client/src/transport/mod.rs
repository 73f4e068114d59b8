//! # Transport Adapter Boundary
//!
//! Purpose: Define what the connection state machine needs from the socket
//! layer: open a session for host:port, submit commands against it, tear it
//! down, and report connect/disconnect/reply outcomes asynchronously.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `Transport` is a trait so tests can script every
//!    callback while production uses `TcpTransport`.
//! 2. **Callbacks by Handle**: Transports report status through
//!    `SessionCallbacks`, which resolves the handle in the process-wide
//!    registry. A retired handle resolves to nothing and the report is dropped.
//! 3. **Never Inline**: Callbacks only post a fact to the owning context's run
//!    queue; no client state is touched on the transport's thread.

mod tcp;

pub use tcp::TcpTransport;

use bytes::Bytes;
use tracing::trace;

use crate::connection::Event;
use crate::error::TransportError;
use crate::registry::{registry, HandleId};
use crate::token::CompletionToken;

/// Outcome carried by connect and disconnect callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Connected, or disconnected on purpose.
    Ok,
    /// Connect failed, or the connection was lost.
    Err,
}

/// Opens sessions to a key-value server.
pub trait Transport: Send + Sync + 'static {
    /// Starts connecting to `host:port`.
    ///
    /// Must not block. An `Err` is an immediate failure and is handled like a
    /// failed connect. On `Ok`, the transport later calls
    /// `callbacks.connected(..)` exactly once, and `callbacks.disconnected(..)`
    /// if an established connection goes away.
    fn open(
        &self,
        host: &str,
        port: u16,
        callbacks: SessionCallbacks,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// One open session.
pub trait Session: Send {
    /// Queues a command; `token.complete(..)` is called with the reply, or
    /// with `None` if the command cannot finish.
    fn submit(&mut self, args: Vec<Bytes>, token: CompletionToken) -> Result<(), TransportError>;

    /// Tears the session down. Outstanding tokens are completed with `None`
    /// and any disconnect report uses `Status::Ok`.
    fn close(&mut self);
}

/// Status callbacks bound to one handle.
#[derive(Debug, Clone)]
pub struct SessionCallbacks {
    handle: HandleId,
}

impl SessionCallbacks {
    pub(crate) fn new(handle: HandleId) -> Self {
        SessionCallbacks { handle }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Reports the outcome of the connect attempt.
    pub fn connected(&self, status: Status) {
        self.post(Event::Connect {
            handle: self.handle,
            status,
        });
    }

    /// Reports that the session went away.
    ///
    /// `Status::Ok` marks a teardown we asked for and is ignored here.
    pub fn disconnected(&self, status: Status) {
        if status == Status::Ok {
            trace!(handle = %self.handle, "ignoring intentional disconnect");
            return;
        }
        self.post(Event::Disconnect {
            handle: self.handle,
            status,
        });
    }

    fn post(&self, event: Event) {
        match registry().lookup(self.handle) {
            Some(queue) => {
                if queue.send(event).is_err() {
                    trace!(handle = %self.handle, "owning context gone; callback dropped");
                }
            }
            None => trace!(handle = %self.handle, "no such session; callback dropped"),
        }
    }
}
