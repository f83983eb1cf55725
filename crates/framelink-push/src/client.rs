//! Push-client session state and control handlers.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use framelink_control::{ActionSender, Dispatcher, MessageHandler};
use framelink_core::{
    CamConfig, CamParam, ControlError, Frame, FrameConfig, FrameParam, RuntimeConfig, SessionId,
};
use framelink_proto::control::{RequestKind, ResponseKind};
use framelink_proto::{payload, DATA_PORT};
use framelink_transport::{DataHandle, DataMode, DataProtocol};

use crate::camera::CameraControl;

/// Session id the server uses in acks that reject a request.
const REJECTED: SessionId = SessionId(0);

struct StreamTask {
    handle: DataHandle,
    task: JoinHandle<()>,
}

/// Shared state of one push client: the camera, its negotiated session, and
/// the send-side data protocol while streaming.
pub struct PushClient {
    pub server_ip: IpAddr,
    pub config: RuntimeConfig,
    camera: Arc<dyn CameraControl>,
    session_id: Mutex<Option<SessionId>>,
    frame_cfg: Mutex<FrameConfig>,
    cam_cfg: Mutex<CamConfig>,
    stream: Mutex<Option<StreamTask>>,
}

impl PushClient {
    pub fn new(server_ip: IpAddr, config: RuntimeConfig, camera: Arc<dyn CameraControl>) -> Arc<Self> {
        let frame = config.frame;
        let cam = config.cam;
        Arc::new(Self {
            server_ip,
            config,
            camera,
            session_id: Mutex::new(None),
            frame_cfg: Mutex::new(frame),
            cam_cfg: Mutex::new(cam),
            stream: Mutex::new(None),
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

    // ── Camera / data-protocol lifecycle ──────────────────────────────────────

    /// Start the camera and the send-side data protocol toward the server.
    async fn start_streaming(&self) -> Result<(), ControlError> {
        if self.stream.lock().unwrap().is_some() {
            warn!("start-stream while already streaming — ignored");
            return Ok(());
        }
        let frame_cfg = *self.frame_cfg.lock().unwrap();
        let cam_cfg = *self.cam_cfg.lock().unwrap();

        let mut source = self
            .camera
            .start(&cam_cfg, &frame_cfg)
            .await
            .map_err(|e| ControlError::BadEnvelope {
                reason: format!("camera start: {e}"),
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.server_ip, DATA_PORT)).await?;

        let mut proto = DataProtocol::new("camera-data", DataMode::Direct, frame_cfg);
        proto.start();
        let handle = proto.handle();
        let mut scratch = Frame::scratch(frame_cfg.max_frame_len(), frame_cfg.format);
        let task = tokio::spawn(async move {
            if let Err(e) = proto.run_send(&socket, &mut *source, &mut scratch).await {
                warn!("camera-data send loop failed: {}", e);
            }
        });

        *self.stream.lock().unwrap() = Some(StreamTask { handle, task });
        info!("Camera streaming to {}:{}", self.server_ip, DATA_PORT);
        Ok(())
    }

    /// Stop the data protocol and power the camera down.
    pub async fn stop_streaming(&self) {
        let Some(stream) = self.stream.lock().unwrap().take() else {
            return;
        };
        stream.handle.stop();
        let _ = stream.task.await;
        if let Err(e) = self.camera.stop().await {
            warn!("camera stop: {}", e);
        }
        info!("Camera streaming stopped");
    }

    /// Geometry changes restart the capture pipeline with the new config.
    async fn apply_frame_config(&self) -> Result<(), ControlError> {
        if self.stream.lock().unwrap().is_none() {
            return Ok(());
        }
        self.stop_streaming().await;
        self.start_streaming().await
    }
}

// ── Dispatch table ────────────────────────────────────────────────────────────

pub fn dispatcher(client: Arc<PushClient>) -> Dispatcher {
    Dispatcher::new()
        .on_request(RequestKind::StartStream, Box::new(StartStream(client.clone())))
        .on_request(RequestKind::StopStream, Box::new(StopStream(client.clone())))
        .on_request(RequestKind::CamSetParam, Box::new(CamSet(client.clone())))
        .on_request(RequestKind::FrameSetParam, Box::new(FrameSet(client.clone())))
        .on_request(RequestKind::SourceSet, Box::new(SourceSwitch(client.clone())))
        .on_request(
            RequestKind::SessionTerminate,
            Box::new(Terminate(client.clone())),
        )
        .on_response(ResponseKind::SessionAck, Box::new(SessionAck(client.clone())))
        .on_response(ResponseKind::StreamAck, Box::new(LogResponse("stream-ack")))
        .on_response(ResponseKind::ParamValue, Box::new(LogResponse("param-value")))
        .on_response(ResponseKind::Sources, Box::new(LogResponse("sources")))
        .on_response(ResponseKind::Pong, Box::new(Pong))
}

// ── Request handlers (server → push) ──────────────────────────────────────────

struct StartStream(Arc<PushClient>);

#[async_trait]
impl MessageHandler for StartStream {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::StartStream::decode(value)?;
        let id = self.0.require_own_session(req.session_id)?;

        match self.0.start_streaming().await {
            Ok(()) => outbox.stream_ack(id),
            Err(e) => {
                // Camera trouble degrades to a rejection; the control
                // connection stays up for a later retry.
                warn!("start-stream failed locally: {}", e);
                outbox.stream_ack(REJECTED)
            }
        }
    }
}

struct StopStream(Arc<PushClient>);

#[async_trait]
impl MessageHandler for StopStream {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::StopStream::decode(value)?;
        let id = self.0.require_own_session(req.session_id)?;
        self.0.stop_streaming().await;
        outbox.stream_ack(id)
    }
}

struct CamSet(Arc<PushClient>);

#[async_trait]
impl MessageHandler for CamSet {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::ParamValue::decode(value)?;
        let id = self.0.require_own_session(req.session_id)?;
        let Some(param) = CamParam::from_id(req.param_id) else {
            return Err(ControlError::BadEnvelope {
                reason: format!("unknown cam param id {}", req.param_id),
            });
        };

        let cfg = {
            let mut cam = self.0.cam_cfg.lock().unwrap();
            param.set(&mut cam, req.value);
            *cam
        };
        self.0
            .camera
            .reconfigure(&cfg)
            .await
            .map_err(|e| ControlError::BadEnvelope {
                reason: format!("camera reconfigure: {e}"),
            })?;
        outbox.param_value(id, req.param_id, req.value)
    }
}

struct FrameSet(Arc<PushClient>);

#[async_trait]
impl MessageHandler for FrameSet {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::ParamValue::decode(value)?;
        let id = self.0.require_own_session(req.session_id)?;
        let Some(param) = FrameParam::from_id(req.param_id) else {
            return Err(ControlError::BadEnvelope {
                reason: format!("unknown frame param id {}", req.param_id),
            });
        };

        let ok = {
            let mut frame = self.0.frame_cfg.lock().unwrap();
            param.set(&mut frame, req.value)
        };
        if !ok {
            return outbox.param_value(REJECTED, req.param_id, 0);
        }
        // Echo the new geometry into the running data protocol
        self.0.apply_frame_config().await?;
        outbox.param_value(id, req.param_id, req.value)
    }
}

struct SourceSwitch(Arc<PushClient>);

#[async_trait]
impl MessageHandler for SourceSwitch {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SourceSet::decode(value)?;
        let id = self.0.require_own_session(req.session_id)?;
        // Source switching is a camera concern; the test pattern has one
        // source, so acknowledge and carry on.
        info!("Source switch to index {}", req.index);
        outbox.session_ack(id)
    }
}

struct Terminate(Arc<PushClient>);

#[async_trait]
impl MessageHandler for Terminate {
    async fn handle(&self, value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SessionTerminate::decode(value)?;
        let _ = self.0.require_own_session(req.session_id)?;
        self.0.stop_streaming().await;
        *self.0.session_id.lock().unwrap() = None;
        Err(ControlError::ConnectionClosed)
    }
}

// ── Response handlers ─────────────────────────────────────────────────────────

struct SessionAck(Arc<PushClient>);

#[async_trait]
impl MessageHandler for SessionAck {
    async fn handle(&self, value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        let ack = payload::SessionAck::decode(value)?;
        if ack.session_id == REJECTED {
            return Err(ControlError::BadEnvelope {
                reason: "server rejected session-init (pool exhausted)".to_owned(),
            });
        }
        *self.0.session_id.lock().unwrap() = Some(ack.session_id);
        info!("Session established: {}", ack.session_id);
        Ok(())
    }
}

struct Pong;

#[async_trait]
impl MessageHandler for Pong {
    async fn handle(&self, value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        let pong = payload::SessionPing::decode(value)?;
        debug!("Pong for ping sent at {}", pong.timestamp);
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
