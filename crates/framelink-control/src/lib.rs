//! framelink-control — the TCP control plane.
//!
//! A bidirectional TLV request/response engine. Each connection owns one
//! [`ControlProtocol`]: outgoing actions are queued through a bounded
//! [`ActionSender`], inbound envelopes are dispatched through a table of
//! typed handlers, and one select-style run loop drives both directions so
//! neither side busy-spins.
//!
//! ```text
//! ActionSender ──► bounded queue ──┐
//!                                  ▼
//!                        ControlProtocol::run ◄──── TCP ────► peer
//!                                  │
//!                                  ▼
//!                        Dispatcher[class][subtype] → handler
//! ```
//!
//! An unregistered handler for an in-range subtype, a handler failure, or a
//! malformed envelope is fatal to the connection — the caller tears down and
//! re-establishes from the top (handshake included).

pub mod actions;
pub mod engine;
pub mod handshake;

pub use actions::{action_channel, ActionReceiver, ActionSender};
pub use engine::{ControlProtocol, Dispatcher, MessageHandler, StopHandle};
pub use handshake::{handshake, HandshakeRole};
