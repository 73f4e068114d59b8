//! # EvKV Client
//!
//! Purpose: Event-driven Redis-compatible client that turns transport
//! callbacks into request/reply notifications and keeps reconnecting every
//! second after a connection is lost.
//!
//! ## Design Principles
//! 1. **Actor per Client**: One Tokio task owns the connection state; every
//!    callback is a message on its run queue.
//! 2. **Weak Back-References**: Completion tokens and pending submissions hold
//!    `Weak` links, so dropping a request at any time is safe.
//! 3. **Strategy Pattern**: The socket layer sits behind the `Transport` trait.
//! 4. **Fail Fast on Misuse**: Double connect and double start return errors
//!    at the call site.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use evkv_client::{Client, RequestEvent};
//!
//! let client = Client::new();
//! client.connect_to_server("127.0.0.1", 6379)?;
//!
//! let mut request = client.create_request();
//! request.set("foo", "hi")?;
//! if let Some(RequestEvent::ReadyRead(reply)) = request.next_event().await {
//!     println!("{:?}", reply);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod registry;
mod request;
mod token;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_RECONNECT_DELAY};
pub use connection::{ClientEvent, ConnectionState};
pub use error::{ClientError, ClientResult, RequestError, RequestResult, TransportError};
pub use evkv_common::Reply;
pub use registry::HandleId;
pub use request::{Request, RequestEvent, RequestId, RequestPhase};
pub use token::CompletionToken;
