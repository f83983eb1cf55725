//! framelink-transport — the UDP data plane.
//!
//! ```text
//! Push client                        Server                         Play client
//! ─────────────────────────          ──────────────────────         ───────────────────
//! DataProtocol::run_send ── UDP ──►  DataProtocol::run_recv
//!   (FrameSource = camera)             │
//!                                      ▼
//!                                    ReassemblyBuffer ──► BufferedSource
//!                                                           │
//!                                    DataProtocol::run_send ┴─ UDP ──► run_recv
//!                                      (NAT mode: learns the            (punches the
//!                                       viewer's mapping)                relay port)
//! ```
//!
//! The [`ReassemblyBuffer`] turns a stream of fixed-size fragments back into
//! complete frames using a pool of pre-allocated slots; the [`DataProtocol`]
//! run loops drive it from a socket, handling NAT hole-punch signaling on
//! traversed paths.

pub mod data;
pub mod reassembly;
pub mod source;

pub use data::{DataHandle, DataMode, DataProtocol};
pub use reassembly::{AssembledFrame, ReassemblyBuffer};
pub use source::{BufferedSource, FrameSource};
