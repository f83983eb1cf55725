//! Play-client session state and control handlers.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use framelink_control::{ActionSender, Dispatcher, MessageHandler};
use framelink_core::{ControlError, RuntimeConfig, SessionId};
use framelink_proto::control::{RequestKind, ResponseKind};
use framelink_proto::{payload, RELAY_PORT};
use framelink_transport::{DataHandle, DataMode, DataProtocol, ReassemblyBuffer};

use crate::sink::FrameSink;

const REJECTED: SessionId = SessionId(0);
/// Consumer-side poll granularity for assembled frames.
const FRAME_POLL: Duration = Duration::from_millis(100);

struct RecvTask {
    handle: DataHandle,
    tasks: Vec<JoinHandle<()>>,
}

/// Shared state of one play client: negotiated session, reassembly buffer,
/// and the receive-side data protocol while a stream is up.
pub struct PlayClient {
    pub server_ip: IpAddr,
    pub config: RuntimeConfig,
    sink: Arc<dyn FrameSink>,
    session_id: Mutex<Option<SessionId>>,
    recv: Mutex<Option<RecvTask>>,
}

impl PlayClient {
    pub fn new(server_ip: IpAddr, config: RuntimeConfig, sink: Arc<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            server_ip,
            config,
            sink,
            session_id: Mutex::new(None),
            recv: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<SessionId> {
        *self.session_id.lock().unwrap()
    }

    fn require_own_session(&self, quoted: SessionId) -> Result<SessionId, ControlError> {
        match self.session_id() {
            Some(id) if id == quoted => Ok(id),
            Some(id) => Err(ControlError::BadEnvelope {
                reason: format!("session id mismatch: quoted {}, holds {}", quoted, id),
            }),
            None => Err(ControlError::BadEnvelope {
                reason: "request before session ack".to_owned(),
            }),
        }
    }

    // ── Receive pipeline ──────────────────────────────────────────────────────

    /// Bind the UDP receive path and start punching the server's relay port.
    /// Runs until [`stop_receiving`](Self::stop_receiving) — frames flow once
    /// the server's send loop learns our mapping and starts relaying.
    async fn start_receiving(&self) -> Result<(), ControlError> {
        if self.recv.lock().unwrap().is_some() {
            return Ok(());
        }
        let frame_cfg = self.config.frame;
        let max_frame_len = frame_cfg.max_frame_len();

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let relay: SocketAddr = (self.server_ip, RELAY_PORT).into();

        let buffer = Arc::new(ReassemblyBuffer::new(
            self.config.assembly_capacity,
            max_frame_len,
            frame_cfg.format,
        ));
        buffer.set_admission(
            Duration::from_millis(self.config.min_frame_interval_ms),
            self.config.ready_backlog,
        );

        let mut proto = DataProtocol::new("play-data", DataMode::Nat, frame_cfg);
        proto.set_peer(relay);
        proto.start();
        let handle = proto.handle();

        let recv_buffer = Arc::clone(&buffer);
        let recv_task = tokio::spawn(async move {
            if let Err(e) = proto.run_recv(&socket, &recv_buffer).await {
                warn!("play-data receive loop failed: {}", e);
            }
        });

        // Consumer loop: drain assembled frames into the sink, returning
        // each slot before asking for the next.
        let consumer_handle = handle.clone();
        let sink = Arc::clone(&self.sink);
        let consume_task = tokio::spawn(async move {
            while consumer_handle.is_enabled() {
                if let Some(frame) = buffer.get_frame(FRAME_POLL).await {
                    sink.present(frame.meta(), frame.data());
                }
            }
            debug!("frame consumer loop stopped");
        });

        *self.recv.lock().unwrap() = Some(RecvTask {
            handle,
            tasks: vec![recv_task, consume_task],
        });
        info!("Receive path up, punching {}", relay);
        Ok(())
    }

    pub async fn stop_receiving(&self) {
        let Some(recv) = self.recv.lock().unwrap().take() else {
            return;
        };
        recv.handle.stop();
        for task in recv.tasks {
            let _ = task.await;
        }
        info!("Receive path stopped");
    }
}

// ── Dispatch table ────────────────────────────────────────────────────────────

pub fn dispatcher(client: Arc<PlayClient>) -> Dispatcher {
    Dispatcher::new()
        .on_request(RequestKind::StopStream, Box::new(StopStream(client.clone())))
        .on_request(
            RequestKind::SessionTerminate,
            Box::new(Terminate(client.clone())),
        )
        .on_response(ResponseKind::SessionAck, Box::new(SessionAck(client.clone())))
        .on_response(ResponseKind::StreamAck, Box::new(StreamAck(client.clone())))
        .on_response(ResponseKind::ParamValue, Box::new(LogResponse("param-value")))
        .on_response(ResponseKind::Sources, Box::new(Sources))
        .on_response(ResponseKind::Pong, Box::new(LogResponse("pong")))
}

// ── Request handlers (server → play) ──────────────────────────────────────────

struct StopStream(Arc<PlayClient>);

#[async_trait]
impl MessageHandler for StopStream {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::StopStream::decode(value)?;
        let id = self.0.require_own_session(req.session_id)?;
        info!("Server stopped the stream");
        self.0.stop_receiving().await;
        outbox.stream_ack(id)
    }
}

struct Terminate(Arc<PlayClient>);

#[async_trait]
impl MessageHandler for Terminate {
    async fn handle(&self, value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SessionTerminate::decode(value)?;
        let _ = self.0.require_own_session(req.session_id)?;
        self.0.stop_receiving().await;
        *self.0.session_id.lock().unwrap() = None;
        Err(ControlError::ConnectionClosed)
    }
}

// ── Response handlers ─────────────────────────────────────────────────────────

/// The session ack drives the whole viewer flow: store the ID, open the
/// receive path (punching first, so the NAT mapping exists before data
/// flows), then ask the server to start the stream.
struct SessionAck(Arc<PlayClient>);

#[async_trait]
impl MessageHandler for SessionAck {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let ack = payload::SessionAck::decode(value)?;
        if ack.session_id == REJECTED {
            return Err(ControlError::BadEnvelope {
                reason: "server rejected session-init (pool exhausted)".to_owned(),
            });
        }
        *self.0.session_id.lock().unwrap() = Some(ack.session_id);
        info!("Session established: {}", ack.session_id);

        self.0.start_receiving().await?;
        outbox.start_stream(ack.session_id)
    }
}

struct StreamAck(Arc<PlayClient>);

#[async_trait]
impl MessageHandler for StreamAck {
    async fn handle(&self, value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        let ack = payload::SessionAck::decode(value)?;
        if ack.session_id == REJECTED {
            // No camera yet — keep the receive path punching and let the
            // operator retry; the control connection stays up.
            warn!("Server rejected start-stream (no primary push yet)");
        } else {
            info!("Stream running (session {})", ack.session_id);
        }
        Ok(())
    }
}

struct Sources;

#[async_trait]
impl MessageHandler for Sources {
    async fn handle(&self, value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        let resp = payload::SourcesResponse::decode(value)?;
        info!("Available sources: {:?}", resp.names);
        Ok(())
    }
}

struct LogResponse(&'static str);

#[async_trait]
impl MessageHandler for LogResponse {
    async fn handle(&self, _value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        debug!("Server response: {}", self.0);
        Ok(())
    }
}
