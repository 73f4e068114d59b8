//! Scripted in-memory transport for unit tests.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::registry::HandleId;
use crate::token::CompletionToken;
use crate::transport::{Session, SessionCallbacks, Transport};

/// Lets the connection task drain its queue on the current-thread runtime.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

struct Opened {
    host: String,
    port: u16,
    callbacks: SessionCallbacks,
}

struct Submitted {
    args: Vec<Bytes>,
    token: CompletionToken,
}

#[derive(Default)]
struct MockLog {
    opened: Vec<Opened>,
    submitted: Vec<Submitted>,
    closed: Vec<HandleId>,
    fail_opens: usize,
    reject_submits: bool,
}

/// Records every call; the test drives the callbacks by hand.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    log: Arc<Mutex<MockLog>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        MockTransport::default()
    }

    pub(crate) fn opened(&self) -> usize {
        self.log.lock().opened.len()
    }

    pub(crate) fn last_target(&self) -> Option<(String, u16)> {
        self.log
            .lock()
            .opened
            .last()
            .map(|opened| (opened.host.clone(), opened.port))
    }

    /// Callbacks handed to the `index`-th successful `open`.
    pub(crate) fn callbacks(&self, index: usize) -> SessionCallbacks {
        self.log.lock().opened[index].callbacks.clone()
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.log.lock().fail_opens = count;
    }

    pub(crate) fn reject_submits(&self, reject: bool) {
        self.log.lock().reject_submits = reject;
    }

    pub(crate) fn is_closed(&self, handle: HandleId) -> bool {
        self.log.lock().closed.contains(&handle)
    }

    pub(crate) fn submitted(&self) -> usize {
        self.log.lock().submitted.len()
    }

    pub(crate) fn submission(&self, index: usize) -> (Vec<Bytes>, CompletionToken) {
        let log = self.log.lock();
        let submitted = &log.submitted[index];
        (submitted.args.clone(), submitted.token.clone())
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        host: &str,
        port: u16,
        callbacks: SessionCallbacks,
    ) -> Result<Box<dyn Session>, TransportError> {
        let mut log = self.log.lock();
        if log.fail_opens > 0 {
            log.fail_opens -= 1;
            return Err(TransportError::InvalidAddress {
                host: host.to_string(),
                port,
            });
        }

        let handle = callbacks.handle();
        log.opened.push(Opened {
            host: host.to_string(),
            port,
            callbacks,
        });
        Ok(Box::new(MockSession {
            handle,
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockSession {
    handle: HandleId,
    log: Arc<Mutex<MockLog>>,
}

impl Session for MockSession {
    fn submit(&mut self, args: Vec<Bytes>, token: CompletionToken) -> Result<(), TransportError> {
        let mut log = self.log.lock();
        if log.reject_submits {
            return Err(TransportError::Closed);
        }
        log.submitted.push(Submitted { args, token });
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().closed.push(self.handle);
    }
}
