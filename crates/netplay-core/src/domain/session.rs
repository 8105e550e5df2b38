//! Transport mode, host scope, and the per-process [`Session`] record.
//!
//! Exactly one `Session` exists per running instance. It is owned by the
//! transport director and mutated only by its transition operations; every
//! other component reads it through accessors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which shape the running instance currently has.
///
/// Legal transitions (anything else is a mode violation at the director):
///
/// ```text
/// Idle ──► Connecting ──► Hosting        (host path, success)
/// Idle ──► Connecting ──► Client         (connect path, success)
///          Connecting ──► Idle           (host/connect failure)
/// Hosting | Client    ──► Idle           (local or remote disconnect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// No session; entity and command operations execute purely locally.
    Idle,
    /// A host bind or an outbound connect is in flight.
    Connecting,
    /// This peer is the session authority.
    Hosting,
    /// This peer is connected to a remote host.
    Client,
}

impl TransportMode {
    /// `true` while traffic is replicated to remote peers.
    pub fn is_networked(self) -> bool {
        matches!(self, TransportMode::Hosting | TransportMode::Client)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportMode::Idle => "idle",
            TransportMode::Connecting => "connecting",
            TransportMode::Hosting => "hosting",
            TransportMode::Client => "client",
        };
        f.write_str(s)
    }
}

/// Visibility of a hosted session. Only meaningful while `Hosting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostScope {
    /// Not announced anywhere; joinable only by direct address.
    Private,
    /// Announced on the local network, not registered with the directory
    /// as publicly listed.
    Lan,
    /// Announced on the local network and listed publicly in the directory.
    Public,
}

/// Errors the session transport reports for a connection attempt.
///
/// This is the wire-level enumerated set: the reason byte in a `HelloAck`
/// and the reason carried by `ConnectFailed` / `HostFailed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectError {
    NoError = 0x00,
    /// The remote end did not answer within the connect timeout.
    Timeout = 0x01,
    /// The remote end refused the connection (wrong password, session full,
    /// or no listener on the port).
    Refused = 0x02,
    /// The peer's game version does not match the host's.
    VersionMismatch = 0x03,
    /// The peer's address is on the host's ban list.
    Banned = 0x04,
    Unknown = 0x05,
}

impl TryFrom<u8> for ConnectError {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ConnectError::NoError),
            0x01 => Ok(ConnectError::Timeout),
            0x02 => Ok(ConnectError::Refused),
            0x03 => Ok(ConnectError::VersionMismatch),
            0x04 => Ok(ConnectError::Banned),
            0x05 => Ok(ConnectError::Unknown),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectError::NoError => "no error",
            ConnectError::Timeout => "timed out",
            ConnectError::Refused => "refused",
            ConnectError::VersionMismatch => "version mismatch",
            ConnectError::Banned => "banned",
            ConnectError::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl ConnectError {
    /// Reason string carried in a join-deny reply.
    pub fn reason_str(self) -> &'static str {
        match self {
            ConnectError::NoError => "ok",
            ConnectError::Timeout => "timeout",
            ConnectError::Refused => "refused",
            ConnectError::VersionMismatch => "version",
            ConnectError::Banned => "banned",
            ConnectError::Unknown => "unknown",
        }
    }

    /// Inverse of [`reason_str`]; unrecognised strings map to `Unknown`.
    ///
    /// [`reason_str`]: ConnectError::reason_str
    pub fn from_reason_str(s: &str) -> Self {
        match s {
            "ok" => ConnectError::NoError,
            "timeout" => ConnectError::Timeout,
            "refused" => ConnectError::Refused,
            "version" => ConnectError::VersionMismatch,
            "banned" => ConnectError::Banned,
            _ => ConnectError::Unknown,
        }
    }
}

/// The live binding of a transport mode plus the scene-prefix fence.
///
/// `scene_prefix` increments on every scene load so that delayed frames from
/// a previous scene are recognisably stale and dropped by the receiver. It
/// never decreases within one process lifetime.
#[derive(Debug, Clone)]
pub struct Session {
    mode: TransportMode,
    dedicated: bool,
    scope: HostScope,
    scene_prefix: u32,
}

impl Session {
    pub fn new() -> Self {
        Self {
            mode: TransportMode::Idle,
            dedicated: false,
            scope: HostScope::Private,
            scene_prefix: 0,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// `true` when hosting without participating as a player.
    pub fn is_dedicated(&self) -> bool {
        self.mode == TransportMode::Hosting && self.dedicated
    }

    pub fn scope(&self) -> HostScope {
        self.scope
    }

    pub fn scene_prefix(&self) -> u32 {
        self.scene_prefix
    }

    /// Moves into `Connecting`. The director validates the transition first.
    pub fn begin_connecting(&mut self) {
        self.mode = TransportMode::Connecting;
    }

    /// Commits a successful host bind.
    pub fn establish_host(&mut self, dedicated: bool, scope: HostScope) {
        self.mode = TransportMode::Hosting;
        self.dedicated = dedicated;
        self.scope = scope;
    }

    /// Commits a successful outbound connect.
    pub fn establish_client(&mut self) {
        self.mode = TransportMode::Client;
        self.dedicated = false;
        self.scope = HostScope::Private;
    }

    /// Returns to `Idle`, keeping the scene prefix (it must never decrease,
    /// even across sessions within one process).
    pub fn reset(&mut self) {
        self.mode = TransportMode::Idle;
        self.dedicated = false;
        self.scope = HostScope::Private;
    }

    /// Increments the scene prefix and returns the new value.
    pub fn advance_scene(&mut self) -> u32 {
        self.scene_prefix += 1;
        self.scene_prefix
    }

    /// Adopts the prefix announced by the host's scene load. Ignores values
    /// that would move the fence backwards.
    pub fn adopt_scene_prefix(&mut self, prefix: u32) {
        if prefix > self.scene_prefix {
            self.scene_prefix = prefix;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
