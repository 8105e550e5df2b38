//! Pure domain state shared by every peer role.
//!
//! Nothing in this module performs I/O. The runtime crate owns the sockets
//! and mutates these types from its single tick thread.

pub mod discovery;
pub mod roster;
pub mod session;
