//! FrameLink rendezvous/relay server.
//!
//! # Flow (per control connection)
//! 1. Accept TCP, run the HELLO/READY handshake as responder
//! 2. Hand the socket to the control engine with the server dispatch table
//! 3. `session-init` claims a pool slot and activates a session
//! 4. The primary play session's `start-stream` wires the UDP relay:
//!    push fragments in on 7878, reassembled frames back out on 7880
//! 5. On any exit, the connection's session is deactivated, its slot
//!    released, and a surviving stream peer is told to stop

mod handlers;
mod relay;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framelink_control::{handshake, ControlProtocol, HandshakeRole};
use framelink_core::RuntimeConfig;
use framelink_discovery::{detect_local_ip, ServerAdvertiser};
use framelink_proto::{CONTROL_PORT, DATA_PORT, RELAY_PORT};
use framelink_session::SessionManager;
use framelink_transport::ReassemblyBuffer;

use crate::relay::StreamCoordinator;
use crate::state::{ConnCtx, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("FrameLink server v{}", env!("CARGO_PKG_VERSION"));

    let config = RuntimeConfig::load("framelink.json");
    let max_frame_len = config.frame.max_frame_len();

    // ── Data-plane sockets ─────────────────────────────────────────────────
    let data_socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", DATA_PORT))
            .await
            .with_context(|| format!("binding UDP data port {}", DATA_PORT))?,
    );
    let relay_socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", RELAY_PORT))
            .await
            .with_context(|| format!("binding UDP relay port {}", RELAY_PORT))?,
    );

    // ── Shared state ───────────────────────────────────────────────────────
    let manager = Arc::new(SessionManager::new(
        config.push_pool_size,
        config.play_pool_size,
        config.frame,
        config.cam,
    ));
    let buffer = Arc::new(ReassemblyBuffer::new(
        config.assembly_capacity,
        max_frame_len,
        config.frame.format,
    ));
    buffer.set_admission(
        std::time::Duration::from_millis(config.min_frame_interval_ms),
        config.ready_backlog,
    );
    let coordinator = StreamCoordinator::new(
        Arc::clone(&manager),
        Arc::clone(&buffer),
        data_socket,
        relay_socket,
        max_frame_len,
    );
    let state = Arc::new(ServerState {
        config: config.clone(),
        manager,
        coordinator,
        sources: vec![
            "front".to_owned(),
            "rear".to_owned(),
            "wide".to_owned(),
        ],
    });

    // ── mDNS advertisement ─────────────────────────────────────────────────
    let local_ip = detect_local_ip();
    let _advertiser = ServerAdvertiser::register(
        "FrameLink Server",
        local_ip,
        DATA_PORT,
        CONTROL_PORT,
        RELAY_PORT,
    )
    .map_err(|e| warn!("mDNS advertising unavailable: {e}"))
    .ok();

    // ── Control listener ───────────────────────────────────────────────────
    let listener = TcpListener::bind(("0.0.0.0", CONTROL_PORT))
        .await
        .with_context(|| format!("binding TCP control port {}", CONTROL_PORT))?;
    info!(
        "Listening on {} (control), {} (data in), {} (relay out) — reach me at {}",
        CONTROL_PORT, DATA_PORT, RELAY_PORT, local_ip
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                // Transient accept failures: log and keep listening
                warn!("accept failed: {}", e);
                continue;
            }
        };
        info!("Control connection from {}", peer);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, state).await {
                warn!("Connection {} ended: {:#}", peer, e);
            } else {
                info!("Connection {} closed cleanly", peer);
            }
        });
    }
}

/// One control connection's full lifecycle: handshake → engine → cleanup.
async fn serve_connection(
    mut stream: tokio::net::TcpStream,
    state: Arc<ServerState>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    handshake(&mut stream, HandshakeRole::Responder)
        .await
        .context("control handshake")?;

    let ctx = ConnCtx::new(Arc::clone(&state));
    let dispatcher = handlers::dispatcher(Arc::clone(&ctx));
    let (mut engine, _outbox, _stop) =
        ControlProtocol::new(dispatcher, state.config.action_queue_depth);

    let result = engine.run(&mut stream).await;

    // Cleanup runs on every exit path: stop a stream this peer was part of,
    // notify the survivor, release the pool slot.
    if let Some(handle) = ctx.take_handle() {
        state.coordinator.handle_disconnect(handle);
        state.manager.deactivate_session(handle);
        state.manager.release(handle);
    }

    result.context("control engine")?;
    Ok(())
}
