use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Malformed envelope: {reason}")]
    BadEnvelope { reason: String },

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Unknown subtype {subtype} for {class}")]
    UnknownSubtype { class: &'static str, subtype: u8 },

    #[error("No handler registered for {class} subtype {subtype}")]
    UnregisteredHandler { class: &'static str, subtype: u8 },

    #[error("Handler for {class} subtype {subtype} failed: {reason}")]
    HandlerFailed {
        class: &'static str,
        subtype: u8,
        reason: String,
    },

    #[error("Handshake payload mismatch (expected {expected:?})")]
    HandshakeMismatch { expected: &'static str },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Action queue full")]
    QueueFull,

    #[error("Action queue closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Declared frame length {len} exceeds slot capacity {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Fragment index {index} out of range (total {total})")]
    FragmentOutOfRange { index: i32, total: i32 },

    #[error("Short datagram: {len} bytes (expected {expected})")]
    ShortDatagram { len: usize, expected: usize },

    #[error("NAT punch failed after {attempts} attempts")]
    NatPunchFailed { attempts: u32 },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection pool exhausted for {client_type} clients")]
    PoolExhausted { client_type: &'static str },

    #[error("Connection has no active session")]
    NoActiveSession,

    #[error("Session already assigned (id {id})")]
    AlreadyAssigned { id: u64 },

    #[error("Session {id} is not the primary {client_type} session")]
    NotPrimary { id: u64, client_type: &'static str },

    #[error("Stale connection handle {index}")]
    StaleHandle { index: usize },
}
