//! # basalt-flight
//!
//! The BasaltDB server request pipeline: Arrow Flight RPC on the
//! outside, the [`basalt_engine::Engine`] contract on the inside.
//!
//! ```text
//! FlightData ──▶ server ──▶ uri (verb + params)
//!                   │
//!                   ▼
//!              dispatcher ──▶ session lock ──▶ codec import
//!                   │                              │
//!                   ▼                              ▼
//!              engine / modality calls ──▶ codec export ──▶ FlightData
//! ```
//!
//! Commands are ASCII URIs (`read?col=1&txn=ab12`), batches carry named
//! columns, and every call runs under a session guard that owns the
//! arena its response buffers live in.

pub mod codec;
pub mod dispatch;
pub mod server;
pub mod session;
pub mod uri;

pub use dispatch::{ActionReply, Dispatcher};
pub use server::BasaltServer;
pub use session::{ClientId, SessionConfig, SessionGuard, SessionId, SessionManager};
