//! # netplay-core
//!
//! Shared library for netplay containing the session wire protocol codec,
//! domain entities, and the connection error taxonomy.
//!
//! This crate is used by every peer role (offline, hosting, dedicated host,
//! client). It has zero dependencies on sockets, timers, or OS APIs: the
//! runtime crate (`netplay-node`) owns all I/O and drives these types from
//! its tick loop.
//!
//! Module map:
//!
//! - **`protocol`** – how bytes travel over the session transport. Frames are
//!   encoded into a compact binary format (20-byte header + payload) and
//!   decoded back into typed Rust structs on the other end.
//! - **`domain`** – pure session state: transport modes, the scene-prefix
//!   fence, discovered-game snapshots, player records.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `netplay_core::TransportMode` instead of the full path.
pub use domain::discovery::DiscoveredGame;
pub use domain::roster::{BanEntry, PlayerId, PlayerRecord};
pub use domain::session::{ConnectError, HostScope, Session, TransportMode};
pub use protocol::codec::{decode_frame, encode_frame, CodecError, Frame};
pub use protocol::messages::SessionMessage;
pub use protocol::sequence::SequenceCounter;
