//! Control-plane TLV envelope.
//!
//! # Wire layout (fixed 260 bytes, big-endian)
//!
//! ```text
//! [0]      type      u8   0 = request, 1 = response
//! [1]      subtype   u8   index into the dispatch table
//! [2..4]   length    u16  valid bytes in `value`
//! [4..260] value     [u8; 256]  payload (tail padded)
//! ```
//!
//! The full envelope is always transmitted; the receiver reads exactly
//! [`ENVELOPE_SIZE`] bytes and validates `length <= MAX_VALUE_LEN` in place.

use bytes::Bytes;
use framelink_core::ControlError;

/// Maximum payload bytes inside one envelope.
pub const MAX_VALUE_LEN: usize = 256;
/// Total on-wire size of every control message.
pub const ENVELOPE_SIZE: usize = MAX_VALUE_LEN + 4;

// ── Message class ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Response,
}

impl MessageClass {
    fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

// ── Subtype tables ────────────────────────────────────────────────────────────

/// Request subtypes. `COUNT` bounds the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    SessionInit = 0,
    SessionTerminate = 1,
    SessionPing = 2,
    StartStream = 3,
    StopStream = 4,
    CamSetParam = 5,
    CamGetParam = 6,
    FrameSetParam = 7,
    FrameGetParam = 8,
    SourceSet = 9,
    SourceGet = 10,
    SourcesList = 11,
}

impl RequestKind {
    pub const COUNT: usize = 12;

    pub fn from_wire(b: u8) -> Option<Self> {
        use RequestKind::*;
        Some(match b {
            0 => SessionInit,
            1 => SessionTerminate,
            2 => SessionPing,
            3 => StartStream,
            4 => StopStream,
            5 => CamSetParam,
            6 => CamGetParam,
            7 => FrameSetParam,
            8 => FrameGetParam,
            9 => SourceSet,
            10 => SourceGet,
            11 => SourcesList,
            _ => return None,
        })
    }
}

/// Response subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseKind {
    SessionAck = 0,
    StreamAck = 1,
    ParamValue = 2,
    Sources = 3,
    Pong = 4,
}

impl ResponseKind {
    pub const COUNT: usize = 5;

    pub fn from_wire(b: u8) -> Option<Self> {
        use ResponseKind::*;
        Some(match b {
            0 => SessionAck,
            1 => StreamAck,
            2 => ParamValue,
            3 => Sources,
            4 => Pong,
            _ => return None,
        })
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One control message: class, subtype, and a length-bounded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub class: MessageClass,
    pub subtype: u8,
    pub value: Bytes,
}

impl Envelope {
    /// Build a request envelope. Fails when `value` exceeds the TLV bound.
    pub fn request(kind: RequestKind, value: Bytes) -> Result<Self, ControlError> {
        Self::new(MessageClass::Request, kind as u8, value)
    }

    /// Build a response envelope.
    pub fn response(kind: ResponseKind, value: Bytes) -> Result<Self, ControlError> {
        Self::new(MessageClass::Response, kind as u8, value)
    }

    fn new(class: MessageClass, subtype: u8, value: Bytes) -> Result<Self, ControlError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(ControlError::PayloadTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
        Ok(Self {
            class,
            subtype,
            value,
        })
    }

    /// Serialize into the fixed 260-byte wire form.
    pub fn encode(&self) -> [u8; ENVELOPE_SIZE] {
        let mut wire = [0u8; ENVELOPE_SIZE];
        wire[0] = self.class.to_wire();
        wire[1] = self.subtype;
        wire[2..4].copy_from_slice(&(self.value.len() as u16).to_be_bytes());
        wire[4..4 + self.value.len()].copy_from_slice(&self.value);
        wire
    }

    /// Parse one received envelope. `wire` must be the full fixed-size read.
    pub fn decode(wire: &[u8]) -> Result<Self, ControlError> {
        if wire.len() != ENVELOPE_SIZE {
            return Err(ControlError::BadEnvelope {
                reason: format!("{} bytes received, expected {}", wire.len(), ENVELOPE_SIZE),
            });
        }
        let class = MessageClass::from_wire(wire[0]).ok_or_else(|| ControlError::BadEnvelope {
            reason: format!("unknown message type {}", wire[0]),
        })?;
        let length = u16::from_be_bytes([wire[2], wire[3]]) as usize;
        if length > MAX_VALUE_LEN {
            return Err(ControlError::BadEnvelope {
                reason: format!("declared length {} exceeds {}", length, MAX_VALUE_LEN),
            });
        }
        Ok(Self {
            class,
            subtype: wire[1],
            value: Bytes::copy_from_slice(&wire[4..4 + length]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlv_round_trip_all_lengths() {
        // P4: (T, S, P) survives encode/decode for every payload length ≤ 256
        for len in [0usize, 1, 17, 255, 256] {
            let value = Bytes::from(vec![0x5A; len]);
            let env = Envelope::request(RequestKind::StartStream, value.clone()).unwrap();
            let back = Envelope::decode(&env.encode()).expect("valid envelope");
            assert_eq!(back.class, MessageClass::Request);
            assert_eq!(back.subtype, RequestKind::StartStream as u8);
            assert_eq!(back.value, value);
        }
    }

    #[test]
    fn oversized_value_rejected_at_build() {
        let err = Envelope::request(RequestKind::SessionPing, Bytes::from(vec![0; 257]));
        assert!(matches!(
            err,
            Err(ControlError::PayloadTooLarge { len: 257, max: 256 })
        ));
    }

    #[test]
    fn bad_declared_length_rejected() {
        let env = Envelope::response(ResponseKind::SessionAck, Bytes::new()).unwrap();
        let mut wire = env.encode();
        wire[2..4].copy_from_slice(&300u16.to_be_bytes());
        assert!(matches!(
            Envelope::decode(&wire),
            Err(ControlError::BadEnvelope { .. })
        ));
    }

    #[test]
    fn truncated_envelope_rejected() {
        let env = Envelope::response(ResponseKind::Pong, Bytes::new()).unwrap();
        let wire = env.encode();
        assert!(matches!(
            Envelope::decode(&wire[..ENVELOPE_SIZE - 1]),
            Err(ControlError::BadEnvelope { .. })
        ));
    }

    #[test]
    fn subtype_tables_cover_wire_range() {
        for i in 0..RequestKind::COUNT as u8 {
            assert!(RequestKind::from_wire(i).is_some());
        }
        assert!(RequestKind::from_wire(RequestKind::COUNT as u8).is_none());
        for i in 0..ResponseKind::COUNT as u8 {
            assert!(ResponseKind::from_wire(i).is_some());
        }
        assert!(ResponseKind::from_wire(ResponseKind::COUNT as u8).is_none());
    }
}
