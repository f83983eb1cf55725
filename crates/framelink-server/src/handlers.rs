//! Server-side control handlers.
//!
//! One dispatch table is built per accepted connection; every request and
//! response subtype a well-behaved peer can send is registered, so the
//! engine's "unregistered handler is fatal" rule only fires on genuinely
//! broken peers.
//!
//! Resource exhaustion (no free pool slot, no primary push) degrades to a
//! rejection ack carrying session id 0 — real IDs start at 1 — while
//! protocol violations (wrong session id, malformed bodies) return errors
//! and tear the connection down.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use framelink_control::{ActionSender, Dispatcher, MessageHandler};
use framelink_core::{CamParam, ClientType, ControlError, FrameParam, SessionId};
use framelink_proto::control::{RequestKind, ResponseKind};
use framelink_proto::payload;

use crate::state::ConnCtx;

/// Session id used in acks that reject a request.
const REJECTED: SessionId = SessionId(0);

/// Build the full dispatch table for one server-side connection.
pub fn dispatcher(ctx: Arc<ConnCtx>) -> Dispatcher {
    Dispatcher::new()
        .on_request(RequestKind::SessionInit, Box::new(SessionInit(ctx.clone())))
        .on_request(
            RequestKind::SessionTerminate,
            Box::new(SessionTerminate(ctx.clone())),
        )
        .on_request(RequestKind::SessionPing, Box::new(SessionPing(ctx.clone())))
        .on_request(RequestKind::StartStream, Box::new(StartStream(ctx.clone())))
        .on_request(RequestKind::StopStream, Box::new(StopStream(ctx.clone())))
        .on_request(
            RequestKind::CamSetParam,
            Box::new(SetParam::cam(ctx.clone())),
        )
        .on_request(
            RequestKind::CamGetParam,
            Box::new(GetParam::cam(ctx.clone())),
        )
        .on_request(
            RequestKind::FrameSetParam,
            Box::new(SetParam::frame(ctx.clone())),
        )
        .on_request(
            RequestKind::FrameGetParam,
            Box::new(GetParam::frame(ctx.clone())),
        )
        .on_request(RequestKind::SourceSet, Box::new(SourceSet(ctx.clone())))
        .on_request(RequestKind::SourceGet, Box::new(SourcesList(ctx.clone())))
        .on_request(RequestKind::SourcesList, Box::new(SourcesList(ctx.clone())))
        .on_response(ResponseKind::SessionAck, Box::new(LogResponse("session-ack")))
        .on_response(ResponseKind::StreamAck, Box::new(LogResponse("stream-ack")))
        .on_response(ResponseKind::ParamValue, Box::new(LogResponse("param-value")))
        .on_response(ResponseKind::Sources, Box::new(LogResponse("sources")))
        .on_response(ResponseKind::Pong, Box::new(LogResponse("pong")))
}

// ── SessionInit ───────────────────────────────────────────────────────────────

struct SessionInit(Arc<ConnCtx>);

#[async_trait]
impl MessageHandler for SessionInit {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SessionInit::decode(value)?;
        let state = &self.0.state;

        let Some(handle) = state.manager.claim(req.client_type) else {
            warn!("{} pool exhausted — rejecting session-init", req.client_type);
            return outbox.session_ack(REJECTED);
        };

        let id = match state.manager.activate_session(handle) {
            Ok(id) => id,
            Err(e) => {
                warn!("session-init failed: {}", e);
                state.manager.release(handle);
                return outbox.session_ack(REJECTED);
            }
        };
        state
            .manager
            .attach_actions(handle, outbox.clone())
            .map_err(|e| ControlError::BadEnvelope {
                reason: e.to_string(),
            })?;
        self.0.set_handle(handle);

        // First camera in becomes the stream source until a source switch
        // moves primacy elsewhere
        if req.client_type == ClientType::Push
            && state.manager.primary_session(ClientType::Push).is_none()
        {
            if let Err(e) = state.manager.set_primary_session(ClientType::Push, handle) {
                warn!("cannot promote session {} to primary push: {}", id, e);
            }
        }

        info!("{} client joined as session {}", req.client_type, id);
        outbox.session_ack(id)
    }
}

// ── SessionTerminate ──────────────────────────────────────────────────────────

struct SessionTerminate(Arc<ConnCtx>);

#[async_trait]
impl MessageHandler for SessionTerminate {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SessionTerminate::decode(value)?;
        let handle = self.0.require_session(req.session_id)?;

        self.0.state.coordinator.handle_disconnect(handle);
        self.0.state.manager.deactivate_session(handle);
        info!("Session {} terminated by request", req.session_id);
        outbox.session_ack(req.session_id)
    }
}

// ── SessionPing ───────────────────────────────────────────────────────────────

struct SessionPing(Arc<ConnCtx>);

#[async_trait]
impl MessageHandler for SessionPing {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SessionPing::decode(value)?;
        let _ = self.0.require_session(req.session_id)?;
        debug!("Ping from session {} @ {}", req.session_id, req.timestamp);
        outbox.pong(req.session_id, req.timestamp)
    }
}

// ── StartStream / StopStream ──────────────────────────────────────────────────

struct StartStream(Arc<ConnCtx>);

#[async_trait]
impl MessageHandler for StartStream {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::StartStream::decode(value)?;
        let handle = self.0.require_session(req.session_id)?;
        let state = &self.0.state;

        // Only the primary play session may start the relay
        if state.manager.primary_session(ClientType::Play) != Some(handle) {
            warn!(
                "start-stream from non-primary session {} — rejected",
                req.session_id
            );
            return outbox.stream_ack(REJECTED);
        }

        match state.coordinator.start_stream(handle) {
            Ok(id) => outbox.stream_ack(id),
            Err(e) => {
                warn!("start-stream rejected: {}", e);
                outbox.stream_ack(REJECTED)
            }
        }
    }
}

struct StopStream(Arc<ConnCtx>);

#[async_trait]
impl MessageHandler for StopStream {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::StopStream::decode(value)?;
        let handle = self.0.require_session(req.session_id)?;

        self.0.state.coordinator.stop_requested_by(handle);
        outbox.stream_ack(req.session_id)
    }
}

// ── Parameter handlers ────────────────────────────────────────────────────────

/// Cam and frame parameter writes share one shape: update the session copy,
/// relay the change to the primary push client, echo the value back.
struct SetParam {
    ctx: Arc<ConnCtx>,
    cam: bool,
}

impl SetParam {
    fn cam(ctx: Arc<ConnCtx>) -> Self {
        Self { ctx, cam: true }
    }

    fn frame(ctx: Arc<ConnCtx>) -> Self {
        Self { ctx, cam: false }
    }
}

#[async_trait]
impl MessageHandler for SetParam {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::ParamValue::decode(value)?;
        let _ = self.ctx.require_session(req.session_id)?;
        let state = &self.ctx.state;

        let Some(push) = state.manager.primary_session(ClientType::Push) else {
            warn!("param set with no primary push — rejected");
            return outbox.param_value(REJECTED, req.param_id, 0);
        };

        let applied = if self.cam {
            let Some(param) = CamParam::from_id(req.param_id) else {
                return Err(ControlError::BadEnvelope {
                    reason: format!("unknown cam param id {}", req.param_id),
                });
            };
            let mut cfg = state.manager.cam_config(push).map_err(reject_to_violation)?;
            param.set(&mut cfg, req.value);
            state
                .manager
                .set_cam_config(push, cfg)
                .map_err(reject_to_violation)?;
            true
        } else {
            let Some(param) = FrameParam::from_id(req.param_id) else {
                return Err(ControlError::BadEnvelope {
                    reason: format!("unknown frame param id {}", req.param_id),
                });
            };
            let mut cfg = state
                .manager
                .frame_config(push)
                .map_err(reject_to_violation)?;
            let ok = param.set(&mut cfg, req.value);
            if ok {
                state
                    .manager
                    .set_frame_config(push, cfg)
                    .map_err(reject_to_violation)?;
            }
            ok
        };
        if !applied {
            return outbox.param_value(REJECTED, req.param_id, 0);
        }

        // Relay to the camera node so the change takes effect at the source
        if let Some(relay) = state.manager.actions(push) {
            let push_id = state.manager.session_id(push).map_err(reject_to_violation)?;
            let sent = if self.cam {
                relay.cam_set_param(push_id, req.param_id, req.value)
            } else {
                relay.frame_set_param(push_id, req.param_id, req.value)
            };
            if let Err(e) = sent {
                warn!("Cannot relay param change to push client: {}", e);
            }
        }

        outbox.param_value(req.session_id, req.param_id, req.value)
    }
}

/// Reads answer from the session copy held by the server — the push client
/// echoes changes here, so the copy is authoritative for viewers.
struct GetParam {
    ctx: Arc<ConnCtx>,
    cam: bool,
}

impl GetParam {
    fn cam(ctx: Arc<ConnCtx>) -> Self {
        Self { ctx, cam: true }
    }

    fn frame(ctx: Arc<ConnCtx>) -> Self {
        Self { ctx, cam: false }
    }
}

#[async_trait]
impl MessageHandler for GetParam {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::ParamGet::decode(value)?;
        let handle = self.ctx.require_session(req.session_id)?;
        let state = &self.ctx.state;

        // A push client reads its own session; viewers read the primary push
        let target = match state.manager.session_type(handle) {
            Ok(ClientType::Push) => handle,
            _ => match state.manager.primary_session(ClientType::Push) {
                Some(h) => h,
                None => return outbox.param_value(REJECTED, req.param_id, 0),
            },
        };

        let current = if self.cam {
            match CamParam::from_id(req.param_id) {
                Some(p) => p.get(&state.manager.cam_config(target).map_err(reject_to_violation)?),
                None => {
                    return Err(ControlError::BadEnvelope {
                        reason: format!("unknown cam param id {}", req.param_id),
                    })
                }
            }
        } else {
            match FrameParam::from_id(req.param_id) {
                Some(p) => p.get(
                    &state
                        .manager
                        .frame_config(target)
                        .map_err(reject_to_violation)?,
                ),
                None => {
                    return Err(ControlError::BadEnvelope {
                        reason: format!("unknown frame param id {}", req.param_id),
                    })
                }
            }
        };
        outbox.param_value(req.session_id, req.param_id, current)
    }
}

// ── Source handlers ───────────────────────────────────────────────────────────

struct SourceSet(Arc<ConnCtx>);

#[async_trait]
impl MessageHandler for SourceSet {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SourceSet::decode(value)?;
        let _ = self.0.require_session(req.session_id)?;
        let state = &self.0.state;

        if req.index as usize >= state.sources.len() {
            warn!("source index {} out of range — rejected", req.index);
            return outbox.session_ack(REJECTED);
        }

        let Some(push) = state.manager.primary_session(ClientType::Push) else {
            return outbox.session_ack(REJECTED);
        };
        if let Some(relay) = state.manager.actions(push) {
            let push_id = state.manager.session_id(push).map_err(reject_to_violation)?;
            if let Err(e) = relay.source_set(push_id, req.index) {
                warn!("Cannot relay source switch: {}", e);
                return outbox.session_ack(REJECTED);
            }
        }
        outbox.session_ack(req.session_id)
    }
}

struct SourcesList(Arc<ConnCtx>);

#[async_trait]
impl MessageHandler for SourcesList {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
        let req = payload::SessionAck::decode(value)?;
        let _ = self.0.require_session(req.session_id)?;
        let names: Vec<&str> = self.0.state.sources.iter().map(String::as_str).collect();
        outbox.sources(req.session_id, &names)
    }
}

// ── Response logging ──────────────────────────────────────────────────────────

/// Responses from clients (acks to relayed requests) need no state change on
/// the server — but an unregistered subtype would kill the connection, so
/// they are accepted and logged.
struct LogResponse(&'static str);

#[async_trait]
impl MessageHandler for LogResponse {
    async fn handle(&self, _value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
        debug!("Client response: {}", self.0);
        Ok(())
    }
}

fn reject_to_violation(e: framelink_core::SessionError) -> ControlError {
    ControlError::BadEnvelope {
        reason: e.to_string(),
    }
}
