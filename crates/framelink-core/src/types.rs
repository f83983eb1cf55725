use serde::{Deserialize, Serialize};

// ── Timestamp ─────────────────────────────────────────────────────────────────

/// Capture timestamp split into whole seconds + microseconds.
///
/// Derived ordering is lexicographic over `(sec, usec)` — the tie-break rule
/// the reassembly buffer uses to find the oldest in-progress frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i64,
}

impl Timestamp {
    pub const ZERO: Self = Self { sec: 0, usec: 0 };

    pub fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    /// Wall-clock timestamp for a frame captured right now.
    pub fn now() -> Self {
        let d = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs() as i64,
            usec: d.subsec_micros() as i64,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

// ── ClientType ────────────────────────────────────────────────────────────────

/// Role of a peer on the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Camera-bearing sender.
    Push,
    /// Viewer / receiver.
    Play,
}

impl ClientType {
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Push),
            1 => Some(Self::Play),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Push => 0,
            Self::Play => 1,
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Play => write!(f, "play"),
        }
    }
}

// ── SessionId ─────────────────────────────────────────────────────────────────

/// Server-assigned session identifier. Generator-assigned, never reused
/// within one server run. Absence (`Option<SessionId>`) replaces the
/// original protocol's `-1` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── PixelFormat ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Yuyv),
            1 => Some(Self::Mjpeg),
            2 => Some(Self::Nv12),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Yuyv => 0,
            Self::Mjpeg => 1,
            Self::Nv12 => 2,
        }
    }
}

// ── FrameMeta / Frame ─────────────────────────────────────────────────────────

/// Metadata describing one captured or displayed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Payload length in bytes.
    pub len: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: Timestamp,
}

/// One camera frame: metadata plus payload bytes.
///
/// Transient — a frame lives either in a reassembly slot or in a scratch
/// buffer owned by its producer; it is never persisted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub meta: FrameMeta,
    pub data: bytes::BytesMut,
}

impl Frame {
    /// Pre-allocate a scratch frame sized for `max_len` payload bytes.
    pub fn scratch(max_len: usize, format: PixelFormat) -> Self {
        Self {
            meta: FrameMeta {
                len: 0,
                width: 0,
                height: 0,
                format,
                timestamp: Timestamp::ZERO,
            },
            data: bytes::BytesMut::zeroed(max_len),
        }
    }

    /// Payload view, truncated to the declared length.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.meta.len.min(self.data.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering_is_lexicographic() {
        let a = Timestamp::new(10, 999_999);
        let b = Timestamp::new(11, 0);
        let c = Timestamp::new(11, 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(Timestamp::new(5, 5), Timestamp::new(5, 5));
    }

    #[test]
    fn client_type_wire_round_trip() {
        for t in [ClientType::Push, ClientType::Play] {
            assert_eq!(ClientType::from_wire(t.to_wire()), Some(t));
        }
        assert_eq!(ClientType::from_wire(9), None);
    }
}
