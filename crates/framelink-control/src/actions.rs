//! Outgoing control actions.
//!
//! Every action a peer can initiate serializes its fixed-layout body and
//! enqueues a ready-to-send [`Envelope`]. The queue is bounded
//! (config-specified depth); a full queue surfaces
//! [`ControlError::QueueFull`] to the caller — retry or drop is the caller's
//! decision, never a silent loss.

use bytes::Bytes;
use tokio::sync::mpsc;

use framelink_core::{ClientType, ControlError, SessionId, Timestamp};
use framelink_proto::control::{Envelope, RequestKind, ResponseKind};
use framelink_proto::payload;

/// Build the bounded action queue for one connection.
pub fn action_channel(depth: usize) -> (ActionSender, ActionReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (ActionSender { tx }, ActionReceiver { rx })
}

/// Receiving half, owned by the connection's [`ControlProtocol`].
///
/// [`ControlProtocol`]: crate::engine::ControlProtocol
pub struct ActionReceiver {
    pub(crate) rx: mpsc::Receiver<Envelope>,
}

/// Clonable enqueue handle. Dropping every clone outside the engine does
/// not tear the connection down — teardown is explicit via [`StopHandle`].
///
/// [`StopHandle`]: crate::engine::StopHandle
#[derive(Clone)]
pub struct ActionSender {
    tx: mpsc::Sender<Envelope>,
}

impl ActionSender {
    fn enqueue(&self, env: Envelope) -> Result<(), ControlError> {
        self.tx.try_send(env).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ControlError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ControlError::QueueClosed,
        })
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    pub fn session_init(&self, client_type: ClientType) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::SessionInit,
            payload::SessionInit { client_type }.encode(),
        )?)
    }

    pub fn session_terminate(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::SessionTerminate,
            payload::SessionTerminate { session_id }.encode(),
        )?)
    }

    pub fn session_ping(
        &self,
        session_id: SessionId,
        timestamp: Timestamp,
    ) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::SessionPing,
            payload::SessionPing {
                session_id,
                timestamp,
            }
            .encode(),
        )?)
    }

    pub fn start_stream(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::StartStream,
            payload::StartStream { session_id }.encode(),
        )?)
    }

    pub fn stop_stream(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::StopStream,
            payload::StopStream { session_id }.encode(),
        )?)
    }

    pub fn cam_set_param(
        &self,
        session_id: SessionId,
        param_id: u16,
        value: u32,
    ) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::CamSetParam,
            payload::ParamValue {
                session_id,
                param_id,
                value,
            }
            .encode(),
        )?)
    }

    pub fn cam_get_param(&self, session_id: SessionId, param_id: u16) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::CamGetParam,
            payload::ParamGet {
                session_id,
                param_id,
            }
            .encode(),
        )?)
    }

    pub fn frame_set_param(
        &self,
        session_id: SessionId,
        param_id: u16,
        value: u32,
    ) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::FrameSetParam,
            payload::ParamValue {
                session_id,
                param_id,
                value,
            }
            .encode(),
        )?)
    }

    pub fn frame_get_param(
        &self,
        session_id: SessionId,
        param_id: u16,
    ) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::FrameGetParam,
            payload::ParamGet {
                session_id,
                param_id,
            }
            .encode(),
        )?)
    }

    pub fn source_set(&self, session_id: SessionId, index: u8) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::SourceSet,
            payload::SourceSet { session_id, index }.encode(),
        )?)
    }

    pub fn source_get(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::SourceGet,
            payload::SourceGet { session_id }.encode(),
        )?)
    }

    pub fn sources_list(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(
            RequestKind::SourcesList,
            payload::SessionAck { session_id }.encode(),
        )?)
    }

    // ── Responses ─────────────────────────────────────────────────────────────

    pub fn session_ack(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.enqueue(Envelope::response(
            ResponseKind::SessionAck,
            payload::SessionAck { session_id }.encode(),
        )?)
    }

    pub fn stream_ack(&self, session_id: SessionId) -> Result<(), ControlError> {
        self.enqueue(Envelope::response(
            ResponseKind::StreamAck,
            payload::SessionAck { session_id }.encode(),
        )?)
    }

    pub fn param_value(
        &self,
        session_id: SessionId,
        param_id: u16,
        value: u32,
    ) -> Result<(), ControlError> {
        self.enqueue(Envelope::response(
            ResponseKind::ParamValue,
            payload::ParamValue {
                session_id,
                param_id,
                value,
            }
            .encode(),
        )?)
    }

    pub fn sources(&self, session_id: SessionId, names: &[&str]) -> Result<(), ControlError> {
        self.enqueue(Envelope::response(
            ResponseKind::Sources,
            payload::SourcesResponse::new(session_id, names).encode(),
        )?)
    }

    pub fn pong(&self, session_id: SessionId, timestamp: Timestamp) -> Result<(), ControlError> {
        self.enqueue(Envelope::response(
            ResponseKind::Pong,
            payload::SessionPing {
                session_id,
                timestamp,
            }
            .encode(),
        )?)
    }

    /// Raw escape hatch for pre-built envelopes.
    pub fn raw(&self, env: Envelope) -> Result<(), ControlError> {
        self.enqueue(env)
    }

    /// Empty-bodied envelope helper (used by subtype-only messages in tests).
    pub fn empty_request(&self, kind: RequestKind) -> Result<(), ControlError> {
        self.enqueue(Envelope::request(kind, Bytes::new())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_proto::control::MessageClass;

    #[test]
    fn queue_full_is_reported_not_dropped() {
        let (tx, _rx) = action_channel(1);
        tx.session_ping(SessionId(1), Timestamp::ZERO).unwrap();
        let err = tx.session_ping(SessionId(1), Timestamp::ZERO).unwrap_err();
        assert!(matches!(err, ControlError::QueueFull));
    }

    #[tokio::test]
    async fn actions_serialize_their_subtype() {
        let (tx, mut rx) = action_channel(4);
        tx.session_init(ClientType::Push).unwrap();
        tx.start_stream(SessionId(7)).unwrap();
        tx.session_ack(SessionId(7)).unwrap();

        let first = rx.rx.recv().await.unwrap();
        assert_eq!(first.class, MessageClass::Request);
        assert_eq!(first.subtype, RequestKind::SessionInit as u8);

        let second = rx.rx.recv().await.unwrap();
        assert_eq!(second.subtype, RequestKind::StartStream as u8);
        let body = payload::StartStream::decode(&second.value).unwrap();
        assert_eq!(body.session_id, SessionId(7));

        let third = rx.rx.recv().await.unwrap();
        assert_eq!(third.class, MessageClass::Response);
        assert_eq!(third.subtype, ResponseKind::SessionAck as u8);
    }
}
