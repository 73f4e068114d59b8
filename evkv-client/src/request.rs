//! # Request Lifecycle
//!
//! Purpose: Represent one outstanding command, or one subscription stream,
//! from `start` until its reply or failure is handed to the caller.
//!
//! ## Design Principles
//! 1. **One Command at a Time**: A request refuses `start` while active;
//!    the gate flips under the request lock.
//! 2. **Deferred Submission**: Without a connected handle the request parks
//!    until the next `connected` and is submitted once from there.
//! 3. **Detach, Don't Destroy**: Dropping a request clears the back-reference
//!    in its outstanding token; a late reply finds nothing and is discarded.
//! 4. **Value Delivery**: Notifications carry their own copy of the reply, so
//!    a handler may drop the request immediately.
//!
//! ## Phases
//!
//! ```text
//! Idle --start--> Queued --+--> InFlight --reply--> Idle        (one-shot)
//!                          |        \--reply--> InFlight        (streaming)
//!                          |        \--final reply--> Idle      (stream ended)
//!                          |        \--failure--> Idle + Error
//!                          \--> AwaitingConnection --connected--> InFlight
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use evkv_common::Reply;

use crate::connection::Event;
use crate::error::{RequestError, RequestResult};
use crate::token::CompletionToken;
use crate::transport::Session;

/// Process-unique request identifier, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Ready for `start`.
    Idle,
    /// Started; the owning context has not picked it up yet.
    Queued,
    /// Waiting for the client to connect.
    AwaitingConnection,
    /// Submitted; waiting for replies.
    InFlight,
}

/// Notification delivered to the owner of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    /// A reply arrived. Streaming requests receive one per message.
    ReadyRead(Reply),
    /// The command failed. The request is idle again.
    Error,
}

struct RequestState {
    phase: RequestPhase,
    streaming: bool,
    args: Vec<Bytes>,
    token: Option<CompletionToken>,
    reply: Option<Reply>,
}

pub(crate) struct RequestInner {
    id: RequestId,
    queue: UnboundedSender<Event>,
    events: UnboundedSender<RequestEvent>,
    state: Mutex<RequestState>,
}

impl RequestInner {
    /// Hands the stored command to `session` with a fresh token.
    pub(crate) fn send_command(
        self: &Arc<Self>,
        session: &mut dyn Session,
        queue: &UnboundedSender<Event>,
    ) {
        let (args, token, streaming) = {
            let mut state = self.state.lock();
            state.streaming = is_subscribe(&state.args);
            let token = CompletionToken::new(Arc::downgrade(self), queue.clone());
            state.token = Some(token.clone());
            state.phase = RequestPhase::InFlight;
            (state.args.clone(), token, state.streaming)
        };

        debug!(
            request = %self.id,
            command = %String::from_utf8_lossy(&args[0]),
            streaming,
            "submitting command"
        );
        if let Err(err) = session.submit(args, token.clone()) {
            warn!(request = %self.id, error = %err, "submit failed");
            self.complete(&token, None, false);
        }
    }

    pub(crate) fn await_connection(&self) {
        self.state.lock().phase = RequestPhase::AwaitingConnection;
        debug!(request = %self.id, "waiting for connection");
    }

    /// Fails a request that never reached a handle.
    pub(crate) fn fail(&self) {
        {
            let mut state = self.state.lock();
            if let Some(token) = state.token.take() {
                token.detach();
            }
            state.phase = RequestPhase::Idle;
        }
        debug!(request = %self.id, "request failed before submission");
        let _ = self.events.send(RequestEvent::Error);
    }

    fn complete(&self, token: &CompletionToken, reply: Option<Reply>, last: bool) {
        let event = {
            let mut state = self.state.lock();
            if !state.token.as_ref().is_some_and(|current| current.same(token)) {
                trace!(request = %self.id, "completion for a superseded token");
                return;
            }
            let ends = !state.streaming || last || reply.is_none();
            if ends {
                if let Some(token) = state.token.take() {
                    token.detach();
                }
            }

            match reply {
                Some(reply) => {
                    if ends {
                        state.phase = RequestPhase::Idle;
                    }
                    state.reply = Some(reply.clone());
                    RequestEvent::ReadyRead(reply)
                }
                None => {
                    state.phase = RequestPhase::Idle;
                    RequestEvent::Error
                }
            }
        };

        trace!(request = %self.id, failed = matches!(event, RequestEvent::Error), "delivering");
        let _ = self.events.send(event);
    }

    fn detach_token(&self) {
        if let Some(token) = self.state.lock().token.take() {
            token.detach();
            trace!(request = %self.id, "released with a command outstanding");
        }
    }
}

/// Runs a completion on the owning context.
pub(crate) fn deliver(token: CompletionToken, reply: Option<Reply>, last: bool) {
    match token.target() {
        Some(request) => request.complete(&token, reply, last),
        None => trace!("request gone; completion discarded"),
    }
}

fn is_subscribe(args: &[Bytes]) -> bool {
    args.first().is_some_and(|name| {
        name.eq_ignore_ascii_case(b"SUBSCRIBE") || name.eq_ignore_ascii_case(b"PSUBSCRIBE")
    })
}

/// A command bound to one client.
///
/// Created by [`Client::create_request`](crate::Client::create_request).
/// A request can be reused: after a one-shot reply or an error it is idle
/// and accepts another `start`.
pub struct Request {
    inner: Arc<RequestInner>,
    events: UnboundedReceiver<RequestEvent>,
}

impl Request {
    pub(crate) fn new(queue: UnboundedSender<Event>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        Request {
            inner: Arc::new(RequestInner {
                id: RequestId::next(),
                queue,
                events,
                state: Mutex::new(RequestState {
                    phase: RequestPhase::Idle,
                    streaming: false,
                    args: Vec::new(),
                    token: None,
                    reply: None,
                }),
            }),
            events: rx,
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// Starts `SET key value`.
    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> RequestResult<()> {
        self.start([&b"SET"[..], key.as_ref(), value.as_ref()])
    }

    /// Starts `GET key`.
    pub fn get(&self, key: impl AsRef<[u8]>) -> RequestResult<()> {
        self.start([&b"GET"[..], key.as_ref()])
    }

    /// Starts `DEL key`.
    pub fn del(&self, key: impl AsRef<[u8]>) -> RequestResult<()> {
        self.start([&b"DEL"[..], key.as_ref()])
    }

    /// Starts an arbitrary command; the first argument is the command name.
    ///
    /// Returns immediately. The outcome arrives through
    /// [`next_event`](Self::next_event).
    pub fn start<I, A>(&self, args: I) -> RequestResult<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args: Vec<Bytes> = args
            .into_iter()
            .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
            .collect();
        if args.is_empty() {
            return Err(RequestError::EmptyCommand);
        }

        {
            let mut state = self.inner.state.lock();
            if state.phase != RequestPhase::Idle {
                return Err(RequestError::AlreadyActive);
            }
            state.phase = RequestPhase::Queued;
            state.streaming = false;
            state.args = args;
        }

        if self
            .inner
            .queue
            .send(Event::Submit(Arc::downgrade(&self.inner)))
            .is_err()
        {
            self.inner.state.lock().phase = RequestPhase::Idle;
            return Err(RequestError::Stopped);
        }
        trace!(request = %self.inner.id, "queued");
        Ok(())
    }

    /// Waits for the next notification.
    ///
    /// Never returns `None` while the request is alive; the `Option` mirrors
    /// the channel it reads from.
    pub async fn next_event(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    /// Returns a notification if one is already waiting.
    pub fn try_next_event(&mut self) -> Option<RequestEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_active(&self) -> bool {
        self.phase() != RequestPhase::Idle
    }

    /// True once a subscribe-family command was submitted.
    pub fn is_streaming(&self) -> bool {
        self.inner.state.lock().streaming
    }

    pub fn phase(&self) -> RequestPhase {
        self.inner.state.lock().phase
    }

    /// The most recent reply, if any.
    pub fn last_reply(&self) -> Option<Reply> {
        self.inner.state.lock().reply.clone()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("phase", &state.phase)
            .field("streaming", &state.streaming)
            .finish()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.inner.detach_token();
    }
}
