//! FrameLink play client — viewer node.
//!
//! # Flow
//! 1. Resolve the server (mDNS instance name or literal IP in
//!    `FRAMELINK_SERVER`, default `framelink-server`)
//! 2. Connect TCP control, HELLO/READY handshake as initiator
//! 3. `session-init(play)` → ack carries our session ID and primacy
//! 4. Open the UDP receive path and punch the relay port, then request
//!    `start-stream`
//! 5. Assembled frames drain into the sink until the stream stops
//!
//! Connection loss tears everything down and retries from the top.

mod client;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framelink_control::{handshake, ActionSender, ControlProtocol, HandshakeRole};
use framelink_core::{ClientType, RuntimeConfig, Timestamp};
use framelink_proto::CONTROL_PORT;

use crate::client::PlayClient;
use crate::sink::StatsSink;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const PING_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("FrameLink play client v{}", env!("CARGO_PKG_VERSION"));

    let config = RuntimeConfig::load("framelink.json");
    let server_name =
        std::env::var("FRAMELINK_SERVER").unwrap_or_else(|_| "framelink-server".to_owned());
    let server_ip = framelink_discovery::resolve(&server_name, Duration::from_secs(10))
        .await
        .with_context(|| format!("resolving server '{}'", server_name))?;
    info!("Server resolved: {} → {}", server_name, server_ip);

    let sink = Arc::new(StatsSink::new());

    loop {
        let client = PlayClient::new(server_ip, config.clone(), sink.clone());
        match run_session(Arc::clone(&client)).await {
            Ok(()) => info!("Session ended cleanly"),
            Err(e) => warn!("Session ended: {:#}", e),
        }
        client.stop_receiving().await;
        tokio::time::sleep(RECONNECT_DELAY).await;
        info!("Reconnecting…");
    }
}

async fn run_session(client: Arc<PlayClient>) -> Result<()> {
    let mut stream = TcpStream::connect((client.server_ip, CONTROL_PORT))
        .await
        .context("TCP connect")?;
    stream.set_nodelay(true)?;

    handshake(&mut stream, HandshakeRole::Initiator)
        .await
        .context("control handshake")?;

    let dispatcher = client::dispatcher(Arc::clone(&client));
    let (mut engine, outbox, _stop) =
        ControlProtocol::new(dispatcher, client.config.action_queue_depth);

    outbox
        .session_init(ClientType::Play)
        .context("queueing session-init")?;

    let keepalive = ping_loop(outbox.clone(), Arc::clone(&client));
    tokio::select! {
        res = engine.run(&mut stream) => res.context("control engine"),
        () = keepalive => unreachable!("ping loop never returns"),
    }
}

async fn ping_loop(outbox: ActionSender, client: Arc<PlayClient>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    loop {
        ticker.tick().await;
        if let Some(id) = client.session_id() {
            if let Err(e) = outbox.session_ping(id, Timestamp::now()) {
                warn!("keepalive skipped: {}", e);
            }
        }
    }
}
