//! Fixed-layout payload bodies carried inside the TLV envelope.
//!
//! Every body is a flat big-endian struct; decode validates the exact
//! length so a malformed payload is caught before it reaches a handler.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use framelink_core::{ClientType, ControlError, SessionId, Timestamp};

/// Maximum advertised camera sources per response.
pub const MAX_SOURCES: usize = 3;
/// Fixed width of one source-name field (NUL-padded ASCII).
pub const SOURCE_NAME_LEN: usize = 30;

fn bad(reason: impl Into<String>) -> ControlError {
    ControlError::BadEnvelope {
        reason: reason.into(),
    }
}

fn expect_len(value: &[u8], want: usize, what: &str) -> Result<(), ControlError> {
    if value.len() != want {
        return Err(bad(format!(
            "{} payload is {} bytes, expected {}",
            what,
            value.len(),
            want
        )));
    }
    Ok(())
}

// ── SessionInit ───────────────────────────────────────────────────────────────

/// `session-init { client_type: u8 }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInit {
    pub client_type: ClientType,
}

impl SessionInit {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.client_type.to_wire()])
    }

    pub fn decode(value: &[u8]) -> Result<Self, ControlError> {
        expect_len(value, 1, "session-init")?;
        let client_type = ClientType::from_wire(value[0])
            .ok_or_else(|| bad(format!("unknown client type {}", value[0])))?;
        Ok(Self { client_type })
    }
}

// ── Session-scoped one-field bodies ───────────────────────────────────────────

macro_rules! session_id_body {
    ($name:ident, $wire:literal) => {
        #[doc = concat!("`", $wire, " { session_id: u64 }`")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub session_id: SessionId,
        }

        impl $name {
            pub fn encode(&self) -> Bytes {
                Bytes::copy_from_slice(&self.session_id.0.to_be_bytes())
            }

            pub fn decode(value: &[u8]) -> Result<Self, ControlError> {
                expect_len(value, 8, $wire)?;
                let mut b = value;
                Ok(Self {
                    session_id: SessionId(b.get_u64()),
                })
            }
        }
    };
}

session_id_body!(SessionTerminate, "session-terminate");
session_id_body!(StartStream, "start-stream");
session_id_body!(StopStream, "stop-stream");
session_id_body!(SessionAck, "session-ack");
session_id_body!(SourceGet, "source-get");

// ── SessionPing ───────────────────────────────────────────────────────────────

/// `session-ping { session_id: u64, ts_sec: i64, ts_usec: i64 }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPing {
    pub session_id: SessionId,
    pub timestamp: Timestamp,
}

impl SessionPing {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(24);
        b.put_u64(self.session_id.0);
        b.put_i64(self.timestamp.sec);
        b.put_i64(self.timestamp.usec);
        b.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, ControlError> {
        expect_len(value, 24, "session-ping")?;
        let mut b = value;
        Ok(Self {
            session_id: SessionId(b.get_u64()),
            timestamp: Timestamp::new(b.get_i64(), b.get_i64()),
        })
    }
}

// ── Parameter bodies ──────────────────────────────────────────────────────────

/// `cam/frame-set-params { session_id: u64, param_id: u16, value: u32 }` —
/// also the shape of the `param-value` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamValue {
    pub session_id: SessionId,
    pub param_id: u16,
    pub value: u32,
}

impl ParamValue {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(14);
        b.put_u64(self.session_id.0);
        b.put_u16(self.param_id);
        b.put_u32(self.value);
        b.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, ControlError> {
        expect_len(value, 14, "param")?;
        let mut b = value;
        Ok(Self {
            session_id: SessionId(b.get_u64()),
            param_id: b.get_u16(),
            value: b.get_u32(),
        })
    }
}

/// `cam/frame-get-params { session_id: u64, param_id: u16 }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamGet {
    pub session_id: SessionId,
    pub param_id: u16,
}

impl ParamGet {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(10);
        b.put_u64(self.session_id.0);
        b.put_u16(self.param_id);
        b.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, ControlError> {
        expect_len(value, 10, "param-get")?;
        let mut b = value;
        Ok(Self {
            session_id: SessionId(b.get_u64()),
            param_id: b.get_u16(),
        })
    }
}

// ── Source selection ──────────────────────────────────────────────────────────

/// `source-set { session_id: u64, index: u8 }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSet {
    pub session_id: SessionId,
    pub index: u8,
}

impl SourceSet {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(9);
        b.put_u64(self.session_id.0);
        b.put_u8(self.index);
        b.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, ControlError> {
        expect_len(value, 9, "source-set")?;
        let mut b = value;
        Ok(Self {
            session_id: SessionId(b.get_u64()),
            index: b.get_u8(),
        })
    }
}

// ── SourcesResponse ───────────────────────────────────────────────────────────

/// `sources-response { session_id: u64, num_sources: u8, names: [[u8;30]; 3] }`
///
/// Name fields are fixed-width, NUL-padded ASCII; all three slots are always
/// transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcesResponse {
    pub session_id: SessionId,
    pub names: Vec<String>,
}

impl SourcesResponse {
    pub fn new(session_id: SessionId, names: &[&str]) -> Self {
        Self {
            session_id,
            names: names
                .iter()
                .take(MAX_SOURCES)
                .map(|n| n.chars().take(SOURCE_NAME_LEN).collect())
                .collect(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(9 + MAX_SOURCES * SOURCE_NAME_LEN);
        b.put_u64(self.session_id.0);
        b.put_u8(self.names.len().min(MAX_SOURCES) as u8);
        for slot in 0..MAX_SOURCES {
            let mut field = [0u8; SOURCE_NAME_LEN];
            if let Some(name) = self.names.get(slot) {
                let bytes = name.as_bytes();
                let n = bytes.len().min(SOURCE_NAME_LEN);
                field[..n].copy_from_slice(&bytes[..n]);
            }
            b.put_slice(&field);
        }
        b.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, ControlError> {
        expect_len(value, 9 + MAX_SOURCES * SOURCE_NAME_LEN, "sources-response")?;
        let mut b = value;
        let session_id = SessionId(b.get_u64());
        let count = (b.get_u8() as usize).min(MAX_SOURCES);
        let mut names = Vec::with_capacity(count);
        for slot in 0..MAX_SOURCES {
            let field = &b[..SOURCE_NAME_LEN];
            if slot < count {
                let end = field.iter().position(|&c| c == 0).unwrap_or(SOURCE_NAME_LEN);
                names.push(String::from_utf8_lossy(&field[..end]).into_owned());
            }
            b.advance(SOURCE_NAME_LEN);
        }
        Ok(Self { session_id, names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_init_round_trip() {
        let p = SessionInit {
            client_type: ClientType::Play,
        };
        assert_eq!(SessionInit::decode(&p.encode()).unwrap(), p);
        assert!(SessionInit::decode(&[7]).is_err());
        assert!(SessionInit::decode(&[]).is_err());
    }

    #[test]
    fn ping_round_trip() {
        let p = SessionPing {
            session_id: SessionId(42),
            timestamp: Timestamp::new(1_700_000_000, 123_456),
        };
        assert_eq!(SessionPing::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn param_bodies_round_trip() {
        let set = ParamValue {
            session_id: SessionId(9),
            param_id: 3,
            value: 0xDEAD_BEEF,
        };
        assert_eq!(ParamValue::decode(&set.encode()).unwrap(), set);

        let get = ParamGet {
            session_id: SessionId(9),
            param_id: 2,
        };
        assert_eq!(ParamGet::decode(&get.encode()).unwrap(), get);
    }

    #[test]
    fn sources_response_pads_and_truncates() {
        let resp = SourcesResponse::new(SessionId(1), &["front", "rear"]);
        let wire = resp.encode();
        assert_eq!(wire.len(), 9 + MAX_SOURCES * SOURCE_NAME_LEN);

        let back = SourcesResponse::decode(&wire).unwrap();
        assert_eq!(back.names, vec!["front".to_owned(), "rear".to_owned()]);
    }

    #[test]
    fn sources_response_caps_name_length() {
        let long = "x".repeat(SOURCE_NAME_LEN + 10);
        let resp = SourcesResponse::new(SessionId(1), &[&long]);
        let back = SourcesResponse::decode(&resp.encode()).unwrap();
        assert_eq!(back.names[0].len(), SOURCE_NAME_LEN);
    }
}
