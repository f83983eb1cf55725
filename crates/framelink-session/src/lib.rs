//! framelink-session — the server's session authority.
//!
//! One [`SessionManager`] instance owns a fixed pool of connection slots
//! (split by client type) and decides which connections are active, which
//! sessions exist, and which session of each type is *primary* — the one
//! authorized to stream. Everything lives behind one coarse mutex; critical
//! sections are short and never block on I/O.
//!
//! ```text
//! claim(type) ─► slot active, unassigned ─► activate_session ─► SessionId
//!      ▲                                          │
//!      └───── release ◄── deactivate_session ◄────┘
//! ```

pub mod manager;

pub use manager::{SessionHandle, SessionManager, SessionSummary};
