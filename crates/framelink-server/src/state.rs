use std::sync::{Arc, Mutex};

use framelink_core::{ControlError, RuntimeConfig, SessionId};
use framelink_session::{SessionHandle, SessionManager};

use crate::relay::StreamCoordinator;

/// Process-wide server state shared by every connection task.
pub struct ServerState {
    pub config: RuntimeConfig,
    pub manager: Arc<SessionManager>,
    pub coordinator: Arc<StreamCoordinator>,
    /// Camera source names advertised to viewers.
    pub sources: Vec<String>,
}

/// Per-connection context threaded through that connection's handlers.
///
/// `handle` is set once the peer's `session-init` lands and cleared when the
/// connection task unwinds.
pub struct ConnCtx {
    pub state: Arc<ServerState>,
    pub handle: Mutex<Option<SessionHandle>>,
}

impl ConnCtx {
    pub fn new(state: Arc<ServerState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            handle: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        *self.handle.lock().unwrap()
    }

    pub fn set_handle(&self, handle: SessionHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn take_handle(&self) -> Option<SessionHandle> {
        self.handle.lock().unwrap().take()
    }

    /// Look up this connection's slot and verify the peer quoted its own
    /// current session ID — anything else is a protocol violation that
    /// tears the connection down.
    pub fn require_session(&self, quoted: SessionId) -> Result<SessionHandle, ControlError> {
        let handle = self.handle().ok_or_else(|| ControlError::BadEnvelope {
            reason: "request before session-init".to_owned(),
        })?;
        let current = self
            .state
            .manager
            .session_id(handle)
            .map_err(|e| ControlError::BadEnvelope {
                reason: e.to_string(),
            })?;
        if current != quoted {
            return Err(ControlError::BadEnvelope {
                reason: format!("session id mismatch: quoted {}, holds {}", quoted, current),
            });
        }
        Ok(handle)
    }
}
