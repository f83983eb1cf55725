//! FrameLink push client — camera node.
//!
//! # Flow
//! 1. Resolve the server (mDNS instance name or literal IP in
//!    `FRAMELINK_SERVER`, default `framelink-server`)
//! 2. Connect TCP control, run the HELLO/READY handshake as initiator
//! 3. Queue `session-init(push)`; the ack carries our session ID
//! 4. Ping at 1 Hz; wait for the server to relay `start-stream`
//! 5. On `start-stream`: camera up, UDP send loop toward the server
//!
//! Connection loss at any point tears everything down and retries the whole
//! setup from the top.

mod camera;
mod client;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framelink_control::{handshake, ActionSender, ControlProtocol, HandshakeRole};
use framelink_core::{ClientType, RuntimeConfig, Timestamp};
use framelink_proto::CONTROL_PORT;

use crate::camera::TestPatternCamera;
use crate::client::PushClient;

/// Delay before retrying the whole connection setup.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("FrameLink push client v{}", env!("CARGO_PKG_VERSION"));

    let config = RuntimeConfig::load("framelink.json");
    let server_name =
        std::env::var("FRAMELINK_SERVER").unwrap_or_else(|_| "framelink-server".to_owned());
    let server_ip = framelink_discovery::resolve(&server_name, Duration::from_secs(10))
        .await
        .with_context(|| format!("resolving server '{}'", server_name))?;
    info!("Server resolved: {} → {}", server_name, server_ip);

    let camera = Arc::new(TestPatternCamera::new());

    loop {
        let client = PushClient::new(server_ip, config.clone(), camera.clone());
        match run_session(Arc::clone(&client)).await {
            Ok(()) => {
                info!("Session ended cleanly");
            }
            Err(e) => {
                warn!("Session ended: {:#}", e);
            }
        }
        client.stop_streaming().await;
        tokio::time::sleep(RECONNECT_DELAY).await;
        info!("Reconnecting…");
    }
}

/// One full control-connection lifetime.
async fn run_session(client: Arc<PushClient>) -> Result<()> {
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
        .session_init(ClientType::Push)
        .context("queueing session-init")?;

    let keepalive = ping_loop(outbox.clone(), Arc::clone(&client));
    tokio::select! {
        res = engine.run(&mut stream) => res.context("control engine"),
        () = keepalive => unreachable!("ping loop never returns"),
    }
}

/// 1 Hz keepalive pings once the session is established. Queue-full just
/// skips a beat — the next tick retries.
async fn ping_loop(outbox: ActionSender, client: Arc<PushClient>) {
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
