//! # TCP Transport
//!
//! Purpose: Run one RESP2 session per handle on a Tokio task and translate
//! socket events into session callbacks and token completions.
//!
//! ## Design Principles
//! 1. **Task per Session**: The session task owns the socket and its buffers;
//!    the handle side only holds a command sender.
//! 2. **FIFO Correlation**: Every command, subscribe family included, joins
//!    one queue in submit order. Replies and (un)subscribe confirmations
//!    are matched against its head.
//! 3. **Push Routing**: `message` and `pmessage` pushes are routed by channel
//!    or pattern to the token that subscribed, which may complete many times.
//! 4. **Streams End Explicitly**: A subscriber whose last channel is
//!    unsubscribed, or whose SUBSCRIBE is rejected, gets a final reply.
//! 5. **Fail Everything on Loss**: When the socket dies, every outstanding
//!    token is completed with `None` before the disconnect is reported.
//!
//! ## Confirmation Counting
//!
//! `SUBSCRIBE a b` is answered by one confirmation per name. A bare
//! `UNSUBSCRIBE` is answered once per channel still subscribed, or once
//! with a nil name when there is none, so its count is fixed when its
//! first confirmation arrives.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::{debug, trace, warn};

use evkv_common::{encode_command, ProtocolError, Reply, RespDecoder};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::registry::HandleId;
use crate::token::CompletionToken;
use crate::transport::{Session, SessionCallbacks, Status, Transport};

/// Tokio TCP implementation of [`Transport`].
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::from_config(&ClientConfig::default())
    }
}

impl TcpTransport {
    pub fn from_config(config: &ClientConfig) -> Self {
        TcpTransport {
            connect_timeout: config.connect_timeout,
            nodelay: config.nodelay,
        }
    }
}

impl Transport for TcpTransport {
    fn open(
        &self,
        host: &str,
        port: u16,
        callbacks: SessionCallbacks,
    ) -> Result<Box<dyn Session>, TransportError> {
        if host.is_empty() || port == 0 {
            return Err(TransportError::InvalidAddress {
                host: host.to_string(),
                port,
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(io::Error::other)?;

        let (commands, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_session(
            host.to_string(),
            port,
            self.clone(),
            callbacks,
            rx,
        ));
        Ok(Box::new(TcpSession {
            commands: Some(commands),
        }))
    }
}

enum SessionCommand {
    Submit {
        args: Vec<Bytes>,
        token: CompletionToken,
    },
    Close,
}

struct TcpSession {
    commands: Option<UnboundedSender<SessionCommand>>,
}

impl Session for TcpSession {
    fn submit(&mut self, args: Vec<Bytes>, token: CompletionToken) -> Result<(), TransportError> {
        let commands = self.commands.as_ref().ok_or(TransportError::Closed)?;
        commands
            .send(SessionCommand::Submit { args, token })
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(SessionCommand::Close);
        }
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_session(
    host: String,
    port: u16,
    options: TcpTransport,
    callbacks: SessionCallbacks,
    mut commands: UnboundedReceiver<SessionCommand>,
) {
    let handle = callbacks.handle();
    let connect = connect_stream(&host, port, &options);
    let outcome = tokio::select! {
        result = connect => Some(result),
        _ = wait_for_close(&mut commands) => None,
    };

    let stream = match outcome {
        Some(Ok(stream)) => stream,
        None => {
            debug!(handle = %handle, "session closed while connecting");
            drain_commands(&mut commands);
            callbacks.disconnected(Status::Ok);
            return;
        }
        Some(Err(err)) => {
            debug!(handle = %handle, %host, port, error = %err, "connect failed");
            drain_commands(&mut commands);
            callbacks.connected(Status::Err);
            return;
        }
    };

    debug!(handle = %handle, %host, port, "tcp connected");
    callbacks.connected(Status::Ok);

    let mut connection = Connection::new(handle, stream);
    let status = connection.run(&mut commands).await;
    connection.fail_outstanding();
    drain_commands(&mut commands);
    callbacks.disconnected(status);
}

async fn connect_stream(host: &str, port: u16, options: &TcpTransport) -> io::Result<TcpStream> {
    let stream = match options.connect_timeout {
        Some(timeout) => time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => TcpStream::connect((host, port)).await?,
    };
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(options.nodelay)?;
    Ok(stream)
}

/// Resolves once the handle side asks for teardown or goes away.
async fn wait_for_close(commands: &mut UnboundedReceiver<SessionCommand>) {
    loop {
        match commands.recv().await {
            Some(SessionCommand::Close) | None => return,
            // Nothing is submitted before the connect callback; fail it anyway.
            Some(SessionCommand::Submit { token, .. }) => token.complete(None),
        }
    }
}

/// Stops accepting commands and fails whatever is still queued.
fn drain_commands(commands: &mut UnboundedReceiver<SessionCommand>) {
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let SessionCommand::Submit { token, .. } = command {
            token.complete(None);
        }
    }
}

enum Step {
    Command(Option<SessionCommand>),
    Read(io::Result<usize>),
}

/// Established connection with reusable buffers.
struct Connection {
    handle: HandleId,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    decoder: RespDecoder,
    router: Router,
}

impl Connection {
    fn new(handle: HandleId, stream: TcpStream) -> Self {
        Connection {
            handle,
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(256),
            decoder: RespDecoder::new(),
            router: Router::new(handle),
        }
    }

    /// Pumps commands and replies until close (`Ok`) or failure (`Err`).
    async fn run(&mut self, commands: &mut UnboundedReceiver<SessionCommand>) -> Status {
        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                read = self.stream.read_buf(&mut self.read_buf) => Step::Read(read),
            };

            match step {
                Step::Command(Some(SessionCommand::Submit { args, token })) => {
                    if let Err(err) = self.write_command(args, token).await {
                        warn!(handle = %self.handle, error = %err, "write failed");
                        return Status::Err;
                    }
                }
                Step::Command(Some(SessionCommand::Close)) | Step::Command(None) => {
                    debug!(handle = %self.handle, "closing session");
                    return Status::Ok;
                }
                Step::Read(Ok(0)) => {
                    debug!(handle = %self.handle, "server closed connection");
                    return Status::Err;
                }
                Step::Read(Ok(_)) => {
                    if let Err(err) = self.dispatch_replies() {
                        warn!(handle = %self.handle, error = %err, "protocol error");
                        return Status::Err;
                    }
                }
                Step::Read(Err(err)) => {
                    debug!(handle = %self.handle, error = %err, "read failed");
                    return Status::Err;
                }
            }
        }
    }

    async fn write_command(&mut self, args: Vec<Bytes>, token: CompletionToken) -> io::Result<()> {
        self.write_buf.clear();
        encode_command(&args, &mut self.write_buf);

        // Queue before writing so a failed write still fails the token.
        self.router.submitted(&args, token);

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await
    }

    fn dispatch_replies(&mut self) -> Result<(), ProtocolError> {
        while let Some(value) = self.decoder.decode(&mut self.read_buf)? {
            self.router.dispatch(Reply::from(value));
        }
        Ok(())
    }

    fn fail_outstanding(&mut self) {
        self.router.fail_all();
    }
}

/// What a submitted command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Exactly one reply.
    Plain,
    /// One confirmation per name.
    Subscribe { pattern: bool, remaining: usize },
    /// One confirmation per name; unknown until the first one for a bare
    /// unsubscribe.
    Unsubscribe { pattern: bool, remaining: Option<usize> },
}

impl Command {
    fn from_args(args: &[Bytes]) -> Command {
        let Some(name) = args.first() else {
            return Command::Plain;
        };
        let names = args.len() - 1;
        let (pattern, base) = split_pattern(name);
        if base.eq_ignore_ascii_case(b"SUBSCRIBE") {
            // A bare SUBSCRIBE is rejected with a single error reply.
            Command::Subscribe {
                pattern,
                remaining: names.max(1),
            }
        } else if base.eq_ignore_ascii_case(b"UNSUBSCRIBE") {
            Command::Unsubscribe {
                pattern,
                remaining: (names > 0).then_some(names),
            }
        } else {
            Command::Plain
        }
    }
}

struct Pending {
    token: CompletionToken,
    command: Command,
}

/// Pub/sub frame recognized in the reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Push {
    Message { pattern: bool, name: Bytes },
    Subscribed { pattern: bool, name: Bytes },
    // `None` when nothing was subscribed.
    Unsubscribed { pattern: bool, name: Option<Bytes> },
}

impl Push {
    fn classify(reply: &Reply) -> Option<Push> {
        let items = reply.as_array()?;
        let (pattern, kind) = split_pattern(items.first()?.as_bytes()?);
        let name = |idx: usize| items.get(idx)?.as_bytes().map(Bytes::copy_from_slice);

        if kind.eq_ignore_ascii_case(b"message") {
            let len = if pattern { 4 } else { 3 };
            if items.len() != len {
                return None;
            }
            return Some(Push::Message {
                pattern,
                name: name(1)?,
            });
        }

        if items.len() != 3 || items[2].as_integer().is_none() {
            return None;
        }
        if kind.eq_ignore_ascii_case(b"subscribe") {
            Some(Push::Subscribed {
                pattern,
                name: name(1)?,
            })
        } else if kind.eq_ignore_ascii_case(b"unsubscribe") {
            Some(Push::Unsubscribed {
                pattern,
                name: name(1),
            })
        } else {
            None
        }
    }
}

/// Splits the `p` prefix off a pattern-family name.
fn split_pattern(name: &[u8]) -> (bool, &[u8]) {
    match name.split_first() {
        Some((first, rest)) if first.eq_ignore_ascii_case(&b'p') => (true, rest),
        _ => (false, name),
    }
}

/// Matches decoded replies to the tokens waiting for them.
struct Router {
    handle: HandleId,
    // Every command in submit order, subscribe family included.
    pending: VecDeque<Pending>,
    channels: HashMap<Bytes, CompletionToken>,
    patterns: HashMap<Bytes, CompletionToken>,
}

impl Router {
    fn new(handle: HandleId) -> Self {
        Router {
            handle,
            pending: VecDeque::new(),
            channels: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    fn submitted(&mut self, args: &[Bytes], token: CompletionToken) {
        let command = Command::from_args(args);
        trace!(handle = %self.handle, ?command, "queued");
        self.pending.push_back(Pending { token, command });
    }

    fn dispatch(&mut self, reply: Reply) {
        match Push::classify(&reply) {
            Some(Push::Message { pattern, name }) => {
                if let Some(token) = self.routes(pattern).get(&name) {
                    token.complete(Some(reply));
                    return;
                }
            }
            Some(Push::Subscribed { pattern, name }) if self.head_awaits(false, pattern) => {
                self.confirm_subscribe(pattern, name, reply);
                return;
            }
            Some(Push::Unsubscribed { pattern, name }) if self.head_awaits(true, pattern) => {
                self.confirm_unsubscribe(pattern, name, reply);
                return;
            }
            _ => {}
        }
        self.complete_head(reply);
    }

    fn routes(&self, pattern: bool) -> &HashMap<Bytes, CompletionToken> {
        if pattern {
            &self.patterns
        } else {
            &self.channels
        }
    }

    fn routes_mut(&mut self, pattern: bool) -> &mut HashMap<Bytes, CompletionToken> {
        if pattern {
            &mut self.patterns
        } else {
            &mut self.channels
        }
    }

    /// True if the head command is answered by this confirmation kind.
    fn head_awaits(&self, unsubscribe: bool, pattern: bool) -> bool {
        match self.pending.front().map(|head| head.command) {
            Some(Command::Subscribe { pattern: p, .. }) => !unsubscribe && p == pattern,
            Some(Command::Unsubscribe { pattern: p, .. }) => unsubscribe && p == pattern,
            _ => false,
        }
    }

    /// Counts one confirmation against the head command and pops it once
    /// complete. Returns the head token and whether it was popped.
    fn count_confirmation(&mut self, subscribed: usize) -> Option<(CompletionToken, bool)> {
        let head = self.pending.front_mut()?;
        let remaining = match &mut head.command {
            Command::Subscribe { remaining, .. } => remaining,
            Command::Unsubscribe { remaining, .. } => remaining.get_or_insert(subscribed.max(1)),
            Command::Plain => return None,
        };
        *remaining = remaining.saturating_sub(1);
        let done = *remaining == 0;
        let token = head.token.clone();
        if done {
            self.pending.pop_front();
        }
        Some((token, done))
    }

    fn routes_to(&self, token: &CompletionToken) -> bool {
        self.channels
            .values()
            .chain(self.patterns.values())
            .any(|route| route.same(token))
    }

    fn confirm_subscribe(&mut self, pattern: bool, name: Bytes, reply: Reply) {
        let Some((token, _)) = self.count_confirmation(0) else {
            return;
        };
        if let Some(previous) = self.routes_mut(pattern).insert(name, token.clone()) {
            if !previous.same(&token) && !self.routes_to(&previous) {
                debug!(handle = %self.handle, "subscription moved to a newer request");
                previous.complete(None);
            }
        }
        token.complete(Some(reply));
    }

    fn confirm_unsubscribe(&mut self, pattern: bool, name: Option<Bytes>, reply: Reply) {
        let subscribed = self.routes(pattern).len();
        let Some((token, done)) = self.count_confirmation(subscribed) else {
            return;
        };
        let removed = name.and_then(|name| self.routes_mut(pattern).remove(&name));
        if let Some(subscriber) = removed {
            if self.routes_to(&subscriber) {
                subscriber.complete(Some(reply.clone()));
            } else {
                trace!(handle = %self.handle, "last subscription released");
                subscriber.finish(reply.clone());
            }
        }
        if done {
            token.complete(Some(reply));
        }
    }

    fn complete_head(&mut self, reply: Reply) {
        match self.pending.pop_front() {
            // Anything but a confirmation means the subscription never started.
            Some(Pending {
                token,
                command: Command::Subscribe { .. },
            }) => token.finish(reply),
            Some(Pending { token, .. }) => token.complete(Some(reply)),
            None => warn!(handle = %self.handle, "reply without a pending command"),
        }
    }

    fn fail_all(&mut self) {
        trace!(
            handle = %self.handle,
            pending = self.pending.len(),
            channels = self.channels.len(),
            patterns = self.patterns.len(),
            "failing outstanding commands"
        );
        for pending in self.pending.drain(..) {
            pending.token.complete(None);
        }
        // One token may cover several channels; later completions find it
        // detached and are discarded.
        for (_, token) in self.channels.drain().chain(self.patterns.drain()) {
            token.complete(None);
        }
    }
}
