//! # Client Errors
//!
//! Errors returned synchronously at call sites. Asynchronous command failures
//! never show up here; they arrive as `RequestEvent::Error` notifications.

use thiserror::Error;

use evkv_common::ProtocolError;

/// Result type for client facade calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type for request calls.
pub type RequestResult<T> = Result<T, RequestError>;

/// Misuse of the client facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// `connect_to_server` was already called on this client.
    #[error("client is already active")]
    AlreadyActive,
    /// The client's event loop is gone.
    #[error("client event loop has stopped")]
    Stopped,
}

/// Misuse of a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// A command is already outstanding on this request.
    #[error("request is already active")]
    AlreadyActive,
    /// `start` was called without a command name.
    #[error("command has no arguments")]
    EmptyCommand,
    /// The owning client's event loop is gone.
    #[error("client event loop has stopped")]
    Stopped,
}

/// Failures reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network or IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Host/port pair cannot name a server.
    #[error("invalid address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },
    /// The session no longer accepts commands.
    #[error("session is closed")]
    Closed,
    /// Peer broke RESP2 framing.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
