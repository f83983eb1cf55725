//! framelink-proto — wire formats shared by every FrameLink node.
//!
//! Two planes, two codecs:
//!
//! ```text
//! Push client                    Server                     Play client
//! ───────────────────────        ─────────────────────      ──────────────────
//! fragment::Fragment ── UDP ──►  ReassemblyBuffer ── UDP ─► fragment::Fragment
//! control::Envelope ─── TCP ──►  dispatch ◄─── TCP ───────  control::Envelope
//! ```
//!
//! All wire integers are big-endian. Both codecs transmit fixed-size units —
//! a 1452-byte data fragment and a 260-byte control envelope — padding
//! included, so a receiver can always read one full unit and validate
//! in place.

pub mod control;
pub mod fragment;
pub mod payload;

pub use control::{Envelope, MessageClass, RequestKind, ResponseKind};
pub use fragment::{Fragment, CHUNK_SIZE, FRAGMENT_WIRE_SIZE};

// ── Control-plane literals (legacy handshake + NAT punch) ─────────────────────

/// Handshake opener, exchanged verbatim by both roles.
pub const HELLO: &[u8] = b"HELLO";
/// Handshake confirmation, exchanged after `HELLO`.
pub const READY: &[u8] = b"READY";
/// NAT hole-punch payload, length- and content-checked on receipt.
pub const NAT_PUNCH: &[u8] = b"BULLET";

// ── Well-known ports ──────────────────────────────────────────────────────────

/// UDP port the server receives push-client fragments on.
pub const DATA_PORT: u16 = 7878;
/// TCP control port on the server.
pub const CONTROL_PORT: u16 = 7879;
/// UDP port the server sends play-client fragments from (punch target).
pub const RELAY_PORT: u16 = 7880;
