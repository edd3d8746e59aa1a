//! Minimal relay chat.
//!
//! Connects to a relay, subscribes to the `chat` module on every (re)connect, prints
//! incoming lines and broadcasts each line read from stdin.
//!
//! Run against a local relay with tracing enabled:
//! ```sh
//! RELAY_UID=me RELAY_SESSION_KEY=secret RUST_LOG=info,global_relay_client=debug \
//!     cargo run --example chat -- --local
//! ```

#![allow(clippy::print_stdout, reason = "Chat lines are the output of this demo")]

use std::sync::Arc;

use global_relay_client::Session;
use global_relay_client::identity::FileTokenStore;
use global_relay_client::ws::{Credentials, Endpoint};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MODULE: &str = "chat";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let local = std::env::args().any(|arg| arg == "--local");
    let credentials = Credentials::new(
        std::env::var("RELAY_UID")?,
        std::env::var("RELAY_SESSION_KEY")?,
    );
    let data_dir = std::env::temp_dir().join("global-relay-demo");

    let session = Session::builder()
        .credentials(credentials)
        .token_store(Arc::new(FileTokenStore::in_dir(&data_dir)))
        .endpoint(Endpoint::from_local_flag(local))
        .notifier(Arc::new(|message: &str| println!("* {message}")))
        .start()?;

    info!(token = %session.token(), "Session started");

    let subscriber = session.clone();
    session.events().on_connect(move |_| {
        if let Err(e) = subscriber.subscribe(MODULE) {
            warn!(error = %e, "Unable to subscribe");
        }
    });
    session.events().on_payload(|envelope| {
        if envelope.module != MODULE {
            return;
        }
        match envelope.deserialize_packet::<String>() {
            Ok(Some(line)) => println!("> {line}"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Unreadable chat packet"),
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if !session.connection_state().is_connected() {
            println!("* not connected, line dropped");
        }
        session.broadcast(&line, MODULE)?;
    }

    session.shutdown();
    Ok(())
}
