//! Infrastructure layer: sockets, the wide-area registry client, and
//! configuration persistence.

pub mod config;
pub mod directory;
pub mod discovery;
pub mod link;
