//! Stream relay: push-data receive loop → reassembly buffer → play-data
//! send loop.
//!
//! ```text
//! push client ── UDP:7878 ──► run_recv ─► ReassemblyBuffer
//!                                              │
//! play client ◄─ UDP:7880 ─── run_send ◄── BufferedSource
//!                  ▲ (address learned from the viewer's punch burst)
//! ```
//!
//! One stream pair exists at a time — the single-viewer simplification the
//! session manager enforces via primary sessions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use framelink_core::{Frame, SessionError, SessionId};
use framelink_session::{SessionHandle, SessionManager};
use framelink_transport::{
    BufferedSource, DataHandle, DataMode, DataProtocol, ReassemblyBuffer,
};

/// Why a running stream is being torn down (for the log line).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    PeerDisconnected,
}

struct ActiveStream {
    push: SessionHandle,
    play: SessionHandle,
    recv_handle: DataHandle,
    send_handle: DataHandle,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the server's data-plane sockets and the lifecycle of the active
/// relay stream.
pub struct StreamCoordinator {
    manager: Arc<SessionManager>,
    buffer: Arc<ReassemblyBuffer>,
    data_socket: Arc<UdpSocket>,
    relay_socket: Arc<UdpSocket>,
    max_frame_len: usize,
    active: Mutex<Option<ActiveStream>>,
}

impl StreamCoordinator {
    pub fn new(
        manager: Arc<SessionManager>,
        buffer: Arc<ReassemblyBuffer>,
        data_socket: Arc<UdpSocket>,
        relay_socket: Arc<UdpSocket>,
        max_frame_len: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            buffer,
            data_socket,
            relay_socket,
            max_frame_len,
            active: Mutex::new(None),
        })
    }

    /// Whether a relay stream is currently running.
    pub fn is_streaming(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// The full stream-start flow, driven by a `START_STREAM` from the
    /// primary play session:
    ///
    /// 1. find the primary push session,
    /// 2. relay `START_STREAM` to it,
    /// 3. start the push-side receive protocol,
    /// 4. copy the push frame config,
    /// 5. start the play-side send protocol with that config.
    ///
    /// Returns `Err` on precondition failures (no primary push, relay queue
    /// full) — the caller degrades to a rejection, the connection survives.
    pub fn start_stream(&self, play: SessionHandle) -> Result<SessionId, SessionError> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            // Already relaying; treat as an idempotent success for the viewer
            return self.manager.session_id(play);
        }

        let push = self
            .manager
            .primary_session(framelink_core::ClientType::Push)
            .ok_or(SessionError::NoActiveSession)?;
        let push_id = self.manager.session_id(push)?;

        // Relay the start request to the camera node
        let relay = self
            .manager
            .actions(push)
            .ok_or(SessionError::NoActiveSession)?;
        if let Err(e) = relay.start_stream(push_id) {
            warn!("Cannot relay start-stream to push {}: {}", push_id, e);
            return Err(SessionError::NoActiveSession);
        }

        let frame_cfg = self.manager.frame_config(push)?;
        self.manager.begin_stream(push, play)?;

        // Push-side receive loop (direct: the camera node knows our address)
        let mut recv_proto = DataProtocol::new("push-data", DataMode::Direct, frame_cfg);
        recv_proto.start();
        let recv_handle = recv_proto.handle();
        let data_socket = Arc::clone(&self.data_socket);
        let buffer = Arc::clone(&self.buffer);
        let recv_task = tokio::spawn(async move {
            if let Err(e) = recv_proto.run_recv(&data_socket, &buffer).await {
                warn!("push-data receive loop failed: {}", e);
            }
        });

        // Play-side send loop (NAT: the viewer's address comes from punches)
        let mut send_proto = DataProtocol::new("play-data", DataMode::Nat, frame_cfg);
        send_proto.start();
        let send_handle = send_proto.handle();
        let relay_socket = Arc::clone(&self.relay_socket);
        let mut source = BufferedSource::new(Arc::clone(&self.buffer), Duration::from_millis(50));
        let mut scratch = Frame::scratch(self.max_frame_len, frame_cfg.format);
        let send_task = tokio::spawn(async move {
            if let Err(e) = send_proto
                .run_send(&relay_socket, &mut source, &mut scratch)
                .await
            {
                warn!("play-data send loop failed: {}", e);
            }
        });

        let play_id = self.manager.session_id(play)?;
        info!(
            "Stream started: push {} → play {} ({}×{})",
            push_id, play_id, frame_cfg.width, frame_cfg.height
        );
        *active = Some(ActiveStream {
            push,
            play,
            recv_handle,
            send_handle,
            tasks: vec![recv_task, send_task],
        });
        Ok(play_id)
    }

    /// Stop both data protocols and clear the stream flags. Notification of
    /// control peers is the caller's business — see
    /// [`stop_requested_by`](Self::stop_requested_by) and
    /// [`handle_disconnect`](Self::handle_disconnect).
    pub fn stop_stream(&self, reason: StopReason) {
        let Some(stream) = self.active.lock().unwrap().take() else {
            return;
        };
        info!("Stopping stream ({:?})", reason);
        stream.recv_handle.stop();
        stream.send_handle.stop();
        for task in stream.tasks {
            // Loops observe the cleared flag within their read timeout
            task.abort();
        }
        self.manager
            .end_stream(Some(stream.push), Some(stream.play));
    }

    /// A peer asked for the stop over control: tear the stream down and tell
    /// the *other* peer.
    pub fn stop_requested_by(&self, requester: SessionHandle) {
        let survivor = self.other_peer(requester);
        self.stop_stream(StopReason::Requested);
        if let Some(survivor) = survivor {
            self.notify_stop(survivor);
        }
    }

    /// A control connection died. If it was part of the active stream, tear
    /// the stream down and tell the *other* still-primary peer to stop.
    pub fn handle_disconnect(&self, gone: SessionHandle) {
        let Some(survivor) = self.other_peer(gone) else {
            return;
        };
        self.stop_stream(StopReason::PeerDisconnected);
        self.notify_stop(survivor);
    }

    fn other_peer(&self, this: SessionHandle) -> Option<SessionHandle> {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(s) if s.push == this => Some(s.play),
            Some(s) if s.play == this => Some(s.push),
            _ => None,
        }
    }

    fn notify_stop(&self, peer: SessionHandle) {
        let Ok(id) = self.manager.session_id(peer) else {
            return;
        };
        match self.manager.actions(peer) {
            Some(actions) => {
                if let Err(e) = actions.stop_stream(id) {
                    warn!("Cannot notify session {} of stream stop: {}", id, e);
                }
            }
            None => warn!("Session {} has no control outbox to notify", id),
        }
    }
}
