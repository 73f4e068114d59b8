//! Sets and reads back a key every few seconds. Restart the server while it
//! runs to watch the client reconnect.
//!
//! ```text
//! RUST_LOG=debug cargo run -p evkv-client --example setget -- 6379
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use evkv_client::{Client, Request, RequestEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(fmt::time::uptime())
        .init();

    let port = match std::env::args().nth(1) {
        Some(port) => port.parse().context("port must be a number")?,
        None => 6379,
    };

    let client = Client::new();
    client.connect_to_server("127.0.0.1", port)?;
    let mut request = client.create_request();

    loop {
        request.set("foo", "hi")?;
        report("SET foo hi", &mut request).await;

        tokio::time::sleep(Duration::from_secs(3)).await;

        request.get("foo")?;
        report("GET foo", &mut request).await;
    }
}

async fn report(command: &str, request: &mut Request) {
    match request.next_event().await {
        Some(RequestEvent::ReadyRead(reply)) => info!(command, ?reply, "reply"),
        Some(RequestEvent::Error) | None => warn!(command, "command failed"),
    }
}
