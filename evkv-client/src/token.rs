//! # Completion Tokens
//!
//! A token correlates one submitted command with its eventual reply. The
//! transport keeps a clone until the reply arrives; the request keeps another
//! while the command is outstanding. Dropping the request clears the token's
//! back-reference instead of destroying the token, so a late reply finds an
//! empty cell and is discarded.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use evkv_common::Reply;

use crate::connection::Event;
use crate::request::RequestInner;

/// Reply correlation handle passed to `Session::submit`.
#[derive(Clone)]
pub struct CompletionToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    target: Mutex<Option<Weak<RequestInner>>>,
    // Run queue of the context that owns the request.
    queue: UnboundedSender<Event>,
}

impl CompletionToken {
    pub(crate) fn new(request: Weak<RequestInner>, queue: UnboundedSender<Event>) -> Self {
        CompletionToken {
            inner: Arc::new(TokenInner {
                target: Mutex::new(Some(request)),
                queue,
            }),
        }
    }

    /// Delivers the outcome of the command.
    ///
    /// `None` means the command failed (connection lost or session closed).
    /// Safe to call from any thread; the delivery itself runs on the
    /// owning context. Streaming commands may complete many times.
    pub fn complete(&self, reply: Option<Reply>) {
        self.post(reply, false);
    }

    /// Delivers the final reply of a streaming command.
    ///
    /// The request sees `reply` as a normal value and then goes idle, as a
    /// one-shot command would. Used when a subscription ends on the server
    /// side, either by a rejected subscribe or by its last unsubscribe.
    pub fn finish(&self, reply: Reply) {
        self.post(Some(reply), true);
    }

    fn post(&self, reply: Option<Reply>, last: bool) {
        if !self.is_attached() {
            trace!("discarding completion for a released request");
            return;
        }
        let event = Event::Completion {
            token: self.clone(),
            reply,
            last,
        };
        if self.inner.queue.send(event).is_err() {
            trace!("owning context gone; completion dropped");
        }
    }

    /// Returns false once the request stopped listening for this command.
    pub fn is_attached(&self) -> bool {
        self.inner.target.lock().is_some()
    }

    pub(crate) fn detach(&self) {
        self.inner.target.lock().take();
    }

    /// Upgrades the back-reference, if the request is still alive.
    pub(crate) fn target(&self) -> Option<Arc<RequestInner>> {
        self.inner.target.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn same(&self, other: &CompletionToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("attached", &self.is_attached())
            .finish()
    }
}
