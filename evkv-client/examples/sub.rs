//! Subscribes to a channel and resubscribes whenever the connection drops.
//!
//! ```text
//! cargo run -p evkv-client --example sub -- test 6379
//! redis-cli publish test hello
//! ```

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use evkv_client::{Client, ClientEvent, RequestEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(fmt::time::uptime())
        .init();

    let mut args = std::env::args().skip(1);
    let channel = args.next().unwrap_or_else(|| "test".to_string());
    let port = match args.next() {
        Some(port) => port.parse().context("port must be a number")?,
        None => 6379,
    };

    let client = Client::new();
    let mut events = client.subscribe();
    client.connect_to_server("127.0.0.1", port)?;

    let mut request = client.create_request();
    request.start(["SUBSCRIBE", channel.as_str()])?;

    loop {
        tokio::select! {
            event = request.next_event() => match event {
                Some(RequestEvent::ReadyRead(reply)) => info!(?reply, "message"),
                Some(RequestEvent::Error) | None => {
                    warn!(%channel, "subscription lost; resubscribing");
                    request.start(["SUBSCRIBE", channel.as_str()])?;
                }
            },
            event = events.recv() => match event {
                Ok(ClientEvent::Connected) => info!(elapsed = ?client.elapsed(), "connected"),
                Ok(ClientEvent::Disconnected) => warn!(elapsed = ?client.elapsed(), "disconnected"),
                Err(err) => warn!(error = %err, "missed client events"),
            },
        }
    }
}
