use std::sync::Mutex;

use tracing::{debug, info};

use framelink_control::ActionSender;
use framelink_core::{CamConfig, ClientType, FrameConfig, SessionError, SessionId};

// ── Slot & session records ────────────────────────────────────────────────────

/// Opaque handle to one connection-pool slot, returned by
/// [`SessionManager::claim`]. Index-based — slots are allocated once at
/// construction and reused for the lifetime of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(usize);

#[derive(Debug, Clone)]
struct Session {
    id: SessionId,
    name: String,
    streaming: bool,
    frame: FrameConfig,
    cam: CamConfig,
}

struct ConnSlot {
    client_type: ClientType,
    active: bool,
    session: Option<Session>,
    /// Outbox of the connection currently holding this slot — the relay
    /// path for server-initiated requests (e.g. START_STREAM toward the
    /// primary push client).
    actions: Option<ActionSender>,
}

/// Scan result for [`SessionManager::active_sessions`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub handle: SessionHandle,
    pub id: SessionId,
    pub name: String,
    pub streaming: bool,
}

struct Inner {
    slots: Vec<ConnSlot>,
    next_id: u64,
    primary_push: Option<usize>,
    primary_play: Option<usize>,
}

// ── SessionManager ────────────────────────────────────────────────────────────

/// Server authority over connections and sessions. All operations take the
/// single internal mutex; callers must never hold results across I/O.
pub struct SessionManager {
    inner: Mutex<Inner>,
    defaults: (FrameConfig, CamConfig),
}

impl SessionManager {
    /// Build a pool of `push_slots` + `play_slots` connection slots.
    pub fn new(
        push_slots: usize,
        play_slots: usize,
        default_frame: FrameConfig,
        default_cam: CamConfig,
    ) -> Self {
        let mut slots = Vec::with_capacity(push_slots + play_slots);
        slots.extend((0..push_slots).map(|_| ConnSlot {
            client_type: ClientType::Push,
            active: false,
            session: None,
            actions: None,
        }));
        slots.extend((0..play_slots).map(|_| ConnSlot {
            client_type: ClientType::Play,
            active: false,
            session: None,
            actions: None,
        }));
        Self {
            inner: Mutex::new(Inner {
                slots,
                next_id: 1,
                primary_push: None,
                primary_play: None,
            }),
            defaults: (default_frame, default_cam),
        }
    }

    // ── Pool management ───────────────────────────────────────────────────────

    /// Claim an inactive slot for `client_type`, marking it active with no
    /// session assigned yet. `None` when the pool for that type is exhausted.
    pub fn claim(&self, client_type: ClientType) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .slots
            .iter()
            .position(|s| s.client_type == client_type && !s.active)?;
        inner.slots[idx].active = true;
        debug!("Claimed {} slot {}", client_type, idx);
        Some(SessionHandle(idx))
    }

    /// Release a slot back to the inactive pool. Any remaining session is
    /// deactivated first.
    pub fn release(&self, handle: SessionHandle) {
        let mut inner = self.inner.lock().unwrap();
        Self::clear_primary(&mut inner, handle.0);
        let slot = &mut inner.slots[handle.0];
        slot.active = false;
        slot.session = None;
        slot.actions = None;
        debug!("Released slot {}", handle.0);
    }

    /// Attach the connection's outbox so other handlers can relay requests
    /// to it.
    pub fn attach_actions(
        &self,
        handle: SessionHandle,
        actions: ActionSender,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::active_slot_mut(&mut inner, handle)?;
        slot.actions = Some(actions);
        Ok(())
    }

    /// Outbox of the connection holding `handle`, if attached.
    pub fn actions(&self, handle: SessionHandle) -> Option<ActionSender> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(handle.0).and_then(|s| s.actions.clone())
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    /// Promote an active-but-unassigned slot to a live session: fresh
    /// generated ID, default name and configs, streaming cleared. A PLAY
    /// session unconditionally becomes the sole primary PLAY (single-viewer
    /// simplification).
    pub fn activate_session(&self, handle: SessionHandle) -> Result<SessionId, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let (default_frame, default_cam) = self.defaults;

        let id = SessionId(inner.next_id);
        let slot = Self::active_slot_mut(&mut inner, handle)?;
        if let Some(existing) = &slot.session {
            return Err(SessionError::AlreadyAssigned { id: existing.id.0 });
        }
        let client_type = slot.client_type;
        slot.session = Some(Session {
            id,
            name: format!("{}-session-{}", client_type, id),
            streaming: false,
            frame: default_frame,
            cam: default_cam,
        });
        inner.next_id += 1;
        if client_type == ClientType::Play {
            inner.primary_play = Some(handle.0);
        }
        info!("Session {} activated ({} slot {})", id, client_type, handle.0);
        Ok(id)
    }

    /// Tear a session down: clears any primary pointer referencing the slot
    /// and returns it to active-but-unassigned.
    pub fn deactivate_session(&self, handle: SessionHandle) {
        let mut inner = self.inner.lock().unwrap();
        Self::clear_primary(&mut inner, handle.0);
        if let Some(session) = inner.slots[handle.0].session.take() {
            info!("Session {} deactivated", session.id);
        }
    }

    // ── Accessors (all fail without an active session) ────────────────────────

    pub fn session_id(&self, handle: SessionHandle) -> Result<SessionId, SessionError> {
        self.with_session(handle, |s| s.id)
    }

    pub fn session_name(&self, handle: SessionHandle) -> Result<String, SessionError> {
        self.with_session(handle, |s| s.name.clone())
    }

    pub fn set_session_name(
        &self,
        handle: SessionHandle,
        name: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.with_session_mut(handle, |s| s.name = name.into())
    }

    pub fn session_type(&self, handle: SessionHandle) -> Result<ClientType, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::active_slot_mut(&mut inner, handle)?;
        if slot.session.is_none() {
            return Err(SessionError::NoActiveSession);
        }
        Ok(slot.client_type)
    }

    pub fn stream_state(&self, handle: SessionHandle) -> Result<bool, SessionError> {
        self.with_session(handle, |s| s.streaming)
    }

    pub fn frame_config(&self, handle: SessionHandle) -> Result<FrameConfig, SessionError> {
        self.with_session(handle, |s| s.frame)
    }

    pub fn set_frame_config(
        &self,
        handle: SessionHandle,
        cfg: FrameConfig,
    ) -> Result<(), SessionError> {
        self.with_session_mut(handle, |s| s.frame = cfg)
    }

    pub fn cam_config(&self, handle: SessionHandle) -> Result<CamConfig, SessionError> {
        self.with_session(handle, |s| s.cam)
    }

    pub fn set_cam_config(
        &self,
        handle: SessionHandle,
        cfg: CamConfig,
    ) -> Result<(), SessionError> {
        self.with_session_mut(handle, |s| s.cam = cfg)
    }

    // ── Primary sessions ──────────────────────────────────────────────────────

    /// The only way PUSH primacy changes (source switching). PLAY primacy is
    /// fixed at activation.
    pub fn set_primary_session(
        &self,
        client_type: ClientType,
        handle: SessionHandle,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::active_slot_mut(&mut inner, handle)?;
        if slot.session.is_none() {
            return Err(SessionError::NoActiveSession);
        }
        match client_type {
            ClientType::Push => inner.primary_push = Some(handle.0),
            ClientType::Play => inner.primary_play = Some(handle.0),
        }
        Ok(())
    }

    pub fn primary_session(&self, client_type: ClientType) -> Option<SessionHandle> {
        let inner = self.inner.lock().unwrap();
        let idx = match client_type {
            ClientType::Push => inner.primary_push,
            ClientType::Play => inner.primary_play,
        }?;
        // A primary pointer only ever references a live session
        inner.slots[idx].session.as_ref()?;
        Some(SessionHandle(idx))
    }

    // ── Stream state (invariant-preserving combined transitions) ──────────────

    /// Mark both ends of a stream as started in one critical section.
    /// Requires `push` to be the primary PUSH and `play` the primary PLAY —
    /// the flags are never set independently from outside this call.
    pub fn begin_stream(
        &self,
        push: SessionHandle,
        play: SessionHandle,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.primary_push != Some(push.0) {
            let id = Self::session_id_of(&inner, push.0);
            return Err(SessionError::NotPrimary {
                id,
                client_type: "push",
            });
        }
        if inner.primary_play != Some(play.0) {
            let id = Self::session_id_of(&inner, play.0);
            return Err(SessionError::NotPrimary {
                id,
                client_type: "play",
            });
        }
        for idx in [push.0, play.0] {
            match inner.slots[idx].session.as_mut() {
                Some(s) => s.streaming = true,
                None => return Err(SessionError::NoActiveSession),
            }
        }
        Ok(())
    }

    /// Clear both streaming flags (idempotent; missing sessions are skipped —
    /// teardown may race a disconnect).
    pub fn end_stream(&self, push: Option<SessionHandle>, play: Option<SessionHandle>) {
        let mut inner = self.inner.lock().unwrap();
        for handle in [push, play].into_iter().flatten() {
            if let Some(s) = inner
                .slots
                .get_mut(handle.0)
                .and_then(|slot| slot.session.as_mut())
            {
                s.streaming = false;
            }
        }
    }

    // ── Scans ─────────────────────────────────────────────────────────────────

    pub fn active_sessions(&self, client_type: ClientType) -> Vec<SessionSummary> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.client_type == client_type && s.active)
            .filter_map(|(idx, s)| {
                s.session.as_ref().map(|sess| SessionSummary {
                    handle: SessionHandle(idx),
                    id: sess.id,
                    name: sess.name.clone(),
                    streaming: sess.streaming,
                })
            })
            .collect()
    }

    pub fn active_session_by_name(
        &self,
        client_type: ClientType,
        name: &str,
    ) -> Option<SessionHandle> {
        self.active_sessions(client_type)
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.handle)
    }

    // ── Internal helpers ──────────────────────────────────────────────────────

    fn with_session<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&Session) -> T,
    ) -> Result<T, SessionError> {
        let inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get(handle.0)
            .ok_or(SessionError::StaleHandle { index: handle.0 })?;
        match (&slot.session, slot.active) {
            (Some(s), true) => Ok(f(s)),
            _ => Err(SessionError::NoActiveSession),
        }
    }

    fn with_session_mut(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut Session),
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get_mut(handle.0)
            .ok_or(SessionError::StaleHandle { index: handle.0 })?;
        match (slot.session.as_mut(), slot.active) {
            (Some(s), true) => {
                f(s);
                Ok(())
            }
            _ => Err(SessionError::NoActiveSession),
        }
    }

    fn active_slot_mut<'a>(
        inner: &'a mut Inner,
        handle: SessionHandle,
    ) -> Result<&'a mut ConnSlot, SessionError> {
        let slot = inner
            .slots
            .get_mut(handle.0)
            .ok_or(SessionError::StaleHandle { index: handle.0 })?;
        if !slot.active {
            return Err(SessionError::NoActiveSession);
        }
        Ok(slot)
    }

    fn clear_primary(inner: &mut Inner, idx: usize) {
        if inner.primary_push == Some(idx) {
            inner.primary_push = None;
        }
        if inner.primary_play == Some(idx) {
            inner.primary_play = None;
        }
    }

    fn session_id_of(inner: &Inner, idx: usize) -> u64 {
        inner.slots[idx]
            .session
            .as_ref()
            .map(|s| s.id.0)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(push: usize, play: usize) -> SessionManager {
        SessionManager::new(push, play, FrameConfig::default(), CamConfig::default())
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        // Scenario 4: pool size 1 for PLAY, two claimants
        let m = manager(2, 1);
        let first = m.claim(ClientType::Play);
        assert!(first.is_some());
        assert!(m.claim(ClientType::Play).is_none());

        // Releasing recycles the slot
        m.release(first.unwrap());
        assert!(m.claim(ClientType::Play).is_some());
    }

    #[test]
    fn session_ids_are_distinct_and_primacy_is_exclusive() {
        // P5: distinct IDs, explicit PUSH primacy, cleared on deactivation
        let m = manager(2, 1);
        let a = m.claim(ClientType::Push).unwrap();
        let b = m.claim(ClientType::Push).unwrap();
        let id_a = m.activate_session(a).unwrap();
        let id_b = m.activate_session(b).unwrap();
        assert_ne!(id_a, id_b);

        assert_eq!(m.primary_session(ClientType::Push), None);
        m.set_primary_session(ClientType::Push, a).unwrap();
        assert_eq!(m.primary_session(ClientType::Push), Some(a));

        // Source switch: primacy moves, never duplicates
        m.set_primary_session(ClientType::Push, b).unwrap();
        assert_eq!(m.primary_session(ClientType::Push), Some(b));

        m.deactivate_session(b);
        assert_eq!(m.primary_session(ClientType::Push), None);
    }

    #[test]
    fn play_activation_takes_primacy_unconditionally() {
        let m = manager(1, 1);
        let p = m.claim(ClientType::Play).unwrap();
        m.activate_session(p).unwrap();
        assert_eq!(m.primary_session(ClientType::Play), Some(p));
    }

    #[test]
    fn accessors_fail_without_active_session() {
        let m = manager(1, 1);
        let h = m.claim(ClientType::Push).unwrap();
        // Active but unassigned: session accessors must fail
        assert!(matches!(
            m.session_id(h),
            Err(SessionError::NoActiveSession)
        ));
        assert!(matches!(
            m.set_frame_config(h, FrameConfig::default()),
            Err(SessionError::NoActiveSession)
        ));

        m.activate_session(h).unwrap();
        assert!(m.session_id(h).is_ok());

        m.deactivate_session(h);
        assert!(matches!(
            m.stream_state(h),
            Err(SessionError::NoActiveSession)
        ));
    }

    #[test]
    fn double_activation_is_rejected() {
        let m = manager(1, 0);
        let h = m.claim(ClientType::Push).unwrap();
        let id = m.activate_session(h).unwrap();
        assert!(matches!(
            m.activate_session(h),
            Err(SessionError::AlreadyAssigned { id: got }) if got == id.0
        ));
    }

    #[test]
    fn begin_stream_requires_both_primaries() {
        let m = manager(1, 1);
        let push = m.claim(ClientType::Push).unwrap();
        let play = m.claim(ClientType::Play).unwrap();
        m.activate_session(push).unwrap();
        m.activate_session(play).unwrap();

        // Push not yet primary
        assert!(matches!(
            m.begin_stream(push, play),
            Err(SessionError::NotPrimary {
                client_type: "push",
                ..
            })
        ));

        m.set_primary_session(ClientType::Push, push).unwrap();
        m.begin_stream(push, play).unwrap();
        assert!(m.stream_state(push).unwrap());
        assert!(m.stream_state(play).unwrap());

        m.end_stream(Some(push), Some(play));
        assert!(!m.stream_state(push).unwrap());
        assert!(!m.stream_state(play).unwrap());
    }

    #[test]
    fn name_scan_finds_sessions() {
        let m = manager(2, 0);
        let h = m.claim(ClientType::Push).unwrap();
        m.activate_session(h).unwrap();
        m.set_session_name(h, "garage-cam").unwrap();

        assert_eq!(
            m.active_session_by_name(ClientType::Push, "garage-cam"),
            Some(h)
        );
        assert_eq!(m.active_session_by_name(ClientType::Push, "missing"), None);
        assert_eq!(m.active_sessions(ClientType::Push).len(), 1);
    }
}
