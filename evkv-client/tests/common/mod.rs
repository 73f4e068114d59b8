//! In-process RESP2 server for integration tests.
//!
//! Supports PING, SET, GET, DEL, PUBLISH and the subscribe family with
//! glob patterns, and lets a test sever every open connection at once.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use evkv_common::{RespDecoder, RespValue};

type Push = mpsc::UnboundedSender<Vec<u8>>;

// Subscribers per channel or pattern, keyed by connection.
type Subscribers = Mutex<HashMap<Vec<u8>, HashMap<u64, Push>>>;

struct Shared {
    store: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    channels: Subscribers,
    patterns: Subscribers,
    kill: broadcast::Sender<()>,
    accepted: AtomicUsize,
    next_conn: AtomicU64,
}

/// Subscriptions held by one connection.
struct ConnState {
    id: u64,
    push: Push,
    channels: Vec<Vec<u8>>,
    patterns: Vec<Vec<u8>>,
}

impl ConnState {
    fn count(&self) -> i64 {
        (self.channels.len() + self.patterns.len()) as i64
    }
}

pub struct FakeServer {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeServer {
    pub async fn start() -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (kill, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            store: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            kill,
            accepted: AtomicUsize::new(0),
            next_conn: AtomicU64::new(1),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let kill = accept_shared.kill.subscribe();
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_shared), kill));
            }
        });

        FakeServer { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Pushes a message to every subscriber of `channel`, by name or by
    /// pattern; returns how many.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> usize {
        publish(&self.shared, channel, payload)
    }

    /// Closes every connection accepted so far.
    pub fn drop_connections(&self) {
        let _ = self.shared.kill.send(());
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    mut kill: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let mut decoder = RespDecoder::new();
    let (push, mut push_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut conn = ConnState {
        id: shared.next_conn.fetch_add(1, Ordering::SeqCst),
        push,
        channels: Vec::new(),
        patterns: Vec::new(),
    };

    let result = serve(
        &mut stream,
        &shared,
        &mut kill,
        &mut decoder,
        &mut conn,
        &mut push_rx,
    )
    .await;
    for channel in &conn.channels {
        unsubscribe(&shared.channels, channel, conn.id);
    }
    for pattern in &conn.patterns {
        unsubscribe(&shared.patterns, pattern, conn.id);
    }
    result
}

async fn serve(
    stream: &mut TcpStream,
    shared: &Shared,
    kill: &mut broadcast::Receiver<()>,
    decoder: &mut RespDecoder,
    conn: &mut ConnState,
    push_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        tokio::select! {
            _ = kill.recv() => return Ok(()),
            Some(frame) = push_rx.recv() => stream.write_all(&frame).await?,
            read = stream.read_buf(&mut buffer) => {
                if read? == 0 {
                    return Ok(());
                }
                while let Some(value) = decoder.decode(&mut buffer).map_err(std::io::Error::other)? {
                    let args = command_args(value);
                    let response = dispatch_command(&args, shared, conn);
                    stream.write_all(&response).await?;
                }
            }
        }
    }
}

fn command_args(value: RespValue) -> Vec<Vec<u8>> {
    match value {
        RespValue::Array(Some(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                RespValue::Bulk(Some(data)) => Some(data.to_vec()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn dispatch_command(args: &[Vec<u8>], shared: &Shared, conn: &mut ConnState) -> Vec<u8> {
    let Some(cmd) = args.first() else {
        return resp_error("empty command");
    };

    if cmd.eq_ignore_ascii_case(b"PING") {
        resp_simple("PONG")
    } else if cmd.eq_ignore_ascii_case(b"SET") && args.len() == 3 {
        shared
            .store
            .lock()
            .insert(args[1].clone(), args[2].clone());
        resp_simple("OK")
    } else if cmd.eq_ignore_ascii_case(b"GET") && args.len() == 2 {
        match shared.store.lock().get(&args[1]) {
            Some(value) => resp_bulk(value),
            None => resp_null(),
        }
    } else if cmd.eq_ignore_ascii_case(b"DEL") && args.len() >= 2 {
        let mut store = shared.store.lock();
        let removed = args[1..].iter().filter(|key| store.remove(*key).is_some()).count();
        resp_integer(removed as i64)
    } else if cmd.eq_ignore_ascii_case(b"SUBSCRIBE") || cmd.eq_ignore_ascii_case(b"PSUBSCRIBE") {
        let pattern = cmd[0].eq_ignore_ascii_case(&b'p');
        if args.len() < 2 {
            return resp_error("wrong number of arguments");
        }
        let kind: &[u8] = if pattern { b"psubscribe" } else { b"subscribe" };
        let mut response = Vec::new();
        for name in &args[1..] {
            let (table, held) = if pattern {
                (&shared.patterns, &mut conn.patterns)
            } else {
                (&shared.channels, &mut conn.channels)
            };
            if !held.contains(name) {
                held.push(name.clone());
                table
                    .lock()
                    .entry(name.clone())
                    .or_default()
                    .insert(conn.id, conn.push.clone());
            }
            response.extend_from_slice(&resp_push(kind, Some(name.as_slice()), conn.count()));
        }
        response
    } else if cmd.eq_ignore_ascii_case(b"UNSUBSCRIBE") || cmd.eq_ignore_ascii_case(b"PUNSUBSCRIBE") {
        let pattern = cmd[0].eq_ignore_ascii_case(&b'p');
        let kind: &[u8] = if pattern { b"punsubscribe" } else { b"unsubscribe" };
        let names = if args.len() > 1 {
            args[1..].to_vec()
        } else if pattern {
            conn.patterns.clone()
        } else {
            conn.channels.clone()
        };
        if names.is_empty() {
            return resp_push(kind, None, conn.count());
        }

        let mut response = Vec::new();
        for name in &names {
            let (table, held) = if pattern {
                (&shared.patterns, &mut conn.patterns)
            } else {
                (&shared.channels, &mut conn.channels)
            };
            held.retain(|existing| existing != name);
            unsubscribe(table, name, conn.id);
            response.extend_from_slice(&resp_push(kind, Some(name.as_slice()), conn.count()));
        }
        response
    } else if cmd.eq_ignore_ascii_case(b"PUBLISH") && args.len() == 3 {
        resp_integer(publish(shared, &args[1], &args[2]) as i64)
    } else {
        resp_error("unknown command")
    }
}

fn unsubscribe(table: &Subscribers, name: &[u8], conn: u64) {
    let mut table = table.lock();
    if let Some(subscribers) = table.get_mut(name) {
        subscribers.remove(&conn);
        if subscribers.is_empty() {
            table.remove(name);
        }
    }
}

fn publish(shared: &Shared, channel: &[u8], payload: &[u8]) -> usize {
    let mut delivered = 0;

    if let Some(subscribers) = shared.channels.lock().get(channel) {
        let mut frame = b"*3\r\n".to_vec();
        frame.extend_from_slice(&resp_bulk(b"message"));
        frame.extend_from_slice(&resp_bulk(channel));
        frame.extend_from_slice(&resp_bulk(payload));
        delivered += subscribers
            .values()
            .filter(|push| push.send(frame.clone()).is_ok())
            .count();
    }

    for (pattern, subscribers) in shared.patterns.lock().iter() {
        if !glob_match(pattern, channel) {
            continue;
        }
        let mut frame = b"*4\r\n".to_vec();
        frame.extend_from_slice(&resp_bulk(b"pmessage"));
        frame.extend_from_slice(&resp_bulk(pattern));
        frame.extend_from_slice(&resp_bulk(channel));
        frame.extend_from_slice(&resp_bulk(payload));
        delivered += subscribers
            .values()
            .filter(|push| push.send(frame.clone()).is_ok())
            .count();
    }

    delivered
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((ch, rest)) => text.first() == Some(ch) && glob_match(rest, &text[1..]),
    }
}

/// `[kind, name, count]` confirmation; a missing name is sent as nil.
fn resp_push(kind: &[u8], name: Option<&[u8]>, count: i64) -> Vec<u8> {
    let mut frame = b"*3\r\n".to_vec();
    frame.extend_from_slice(&resp_bulk(kind));
    match name {
        Some(name) => frame.extend_from_slice(&resp_bulk(name)),
        None => frame.extend_from_slice(&resp_null()),
    }
    frame.extend_from_slice(&resp_integer(count));
    frame
}

fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 6);
    buf.extend_from_slice(b"-ERR ");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_integer(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = format!("${}\r\n", data.len()).into_bytes();
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}
