//! Application layer: the transport-mode state machine, the command table,
//! the roster, and the process context that owns them.

pub mod commands;
pub mod context;
pub mod director;
pub mod roster;
