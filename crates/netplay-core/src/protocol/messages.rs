//! All netplay session protocol message types.
//!
//! Two layers share one frame format. Transport frames (`Hello`, `HelloAck`,
//! `Ping`, `Pong`, `Disconnect`) manage the connection itself and carry a
//! zero scene prefix. Session frames (`Command`, `EntitySpawn`,
//! `EntityDestroy`, `SceneLoad`) carry replicated gameplay traffic tagged
//! with the sender's scene prefix; the receiver drops scene-scoped frames
//! (entity traffic and scene loads) whose prefix is older than its current
//! scene.

use serde::{Deserialize, Serialize};

use crate::domain::session::ConnectError;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common frame header in bytes.
pub const HEADER_SIZE: usize = 20;

// ── Message type codes ────────────────────────────────────────────────────────

/// Frame type codes. Transport frames occupy `0x00–0x0F`, session frames
/// `0x10–0x1F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloAck = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Disconnect = 0x05,
    Command = 0x10,
    EntitySpawn = 0x11,
    EntityDestroy = 0x12,
    SceneLoad = 0x13,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::HelloAck),
            0x03 => Ok(MessageType::Ping),
            0x04 => Ok(MessageType::Pong),
            0x05 => Ok(MessageType::Disconnect),
            0x10 => Ok(MessageType::Command),
            0x11 => Ok(MessageType::EntitySpawn),
            0x12 => Ok(MessageType::EntityDestroy),
            0x13 => Ok(MessageType::SceneLoad),
            _ => Err(()),
        }
    }
}

impl MessageType {
    /// Session-layer frames carry a meaningful scene prefix; transport
    /// frames always carry zero.
    pub fn is_session_frame(self) -> bool {
        (self as u8) >= 0x10
    }
}

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Peer identifier on the session link. The host is always peer 0; connected
/// peers are numbered from 1 in accept order.
pub type PeerId = u32;

/// The host's own peer id.
pub const HOST_PEER_ID: PeerId = 0;

/// Replicated entity identifier: the spawning peer plus a per-peer counter.
/// Unique session-wide without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    /// Peer that issued the spawn.
    pub owner: PeerId,
    /// Position in the owner's spawn sequence, starting at 1.
    pub index: u32,
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner, self.index)
    }
}

// ── Command dispatch vocabulary ───────────────────────────────────────────────

/// A positional command argument. The wire contract is an ordered list of
/// these; the receiving registry matches them against the command's schema
/// before invoking the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
    Vec3([f32; 3]),
    Quat([f32; 4]),
}

impl ArgValue {
    pub fn kind(&self) -> ArgKind {
        match self {
            ArgValue::Bool(_) => ArgKind::Bool,
            ArgValue::Int(_) => ArgKind::Int,
            ArgValue::Float(_) => ArgKind::Float,
            ArgValue::Str(_) => ArgKind::Str,
            ArgValue::Vec3(_) => ArgKind::Vec3,
            ArgValue::Quat(_) => ArgKind::Quat,
        }
    }
}

/// Argument type tag used in command schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ArgKind {
    Bool = 0x01,
    Int = 0x02,
    Float = 0x03,
    Str = 0x04,
    Vec3 = 0x05,
    Quat = 0x06,
}

impl TryFrom<u8> for ArgKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(ArgKind::Bool),
            0x02 => Ok(ArgKind::Int),
            0x03 => Ok(ArgKind::Float),
            0x04 => Ok(ArgKind::Str),
            0x05 => Ok(ArgKind::Vec3),
            0x06 => Ok(ArgKind::Quat),
            _ => Err(()),
        }
    }
}

/// Delivery guarantee for a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Durability {
    /// Retained host-side and replayed, in original send order, to every
    /// peer that joins afterwards.
    Buffered = 0x01,
    /// Delivered only to peers present at send time.
    Transient = 0x02,
}

impl TryFrom<u8> for Durability {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(Durability::Buffered),
            0x02 => Ok(Durability::Transient),
            _ => Err(()),
        }
    }
}

/// Who receives a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchScope {
    /// Every peer including the sender.
    All,
    /// The session authority only.
    Server,
    /// Exactly one peer.
    Single(PeerId),
}

/// What a command is addressed to: the session itself or one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchTarget {
    Session,
    Entity(EntityId),
}

// ── Transport frame payloads ──────────────────────────────────────────────────

/// HELLO (0x01): first frame sent by a connecting peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version the peer speaks; must equal [`PROTOCOL_VERSION`].
    pub protocol_version: u8,
    /// Plaintext session password. Empty when the host requires none.
    pub password: String,
    /// Name the peer will later register in the roster.
    pub display_name: String,
}

/// HELLO_ACK (0x02): the host's verdict on a `Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckMessage {
    pub accepted: bool,
    /// `ConnectError::NoError` when accepted.
    pub reason: ConnectError,
    /// Peer id assigned by the host; 0 (the host's own id) when rejected.
    pub peer_id: PeerId,
    /// The host's current scene prefix. The joiner adopts it as its fence
    /// immediately, so its first frames are not mistaken for stale traffic.
    pub scene_prefix: u32,
}

/// Reason for a graceful `Disconnect` (0x05).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LeaveReason {
    UserInitiated = 0x01,
    HostShutdown = 0x02,
    Kicked = 0x03,
    Timeout = 0x04,
    ProtocolError = 0x05,
}

impl TryFrom<u8> for LeaveReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(LeaveReason::UserInitiated),
            0x02 => Ok(LeaveReason::HostShutdown),
            0x03 => Ok(LeaveReason::Kicked),
            0x04 => Ok(LeaveReason::Timeout),
            0x05 => Ok(LeaveReason::ProtocolError),
            _ => Err(()),
        }
    }
}

// ── Session frame payloads ────────────────────────────────────────────────────

/// COMMAND (0x10): a named dispatch with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Peer the dispatch originated from. Filled by the host when
    /// forwarding a client's broadcast.
    pub sender: PeerId,
    pub target: DispatchTarget,
    pub name: String,
    pub args: Vec<ArgValue>,
    pub durability: Durability,
    pub scope: DispatchScope,
}

/// ENTITY_SPAWN (0x11): replicated entity creation. Buffered by the host so
/// late joiners materialise the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpawnMessage {
    pub entity: EntityId,
    /// Asset/archetype name resolved by the gameplay layer.
    pub descriptor: String,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    /// Interest group; the transport carries it opaquely.
    pub group: u8,
}

/// ENTITY_DESTROY (0x12): replicated entity removal. Transient – the matching
/// buffered spawn is dropped instead, so late joiners never see the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDestroyMessage {
    pub entity: EntityId,
}

/// SCENE_LOAD (0x13): buffered host broadcast moving every peer to a scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneLoadMessage {
    pub scene_name: String,
    /// Strictly increasing across loads within one session; the receiver
    /// adopts it as its fence.
    pub scene_prefix: u32,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// All valid session frames, discriminated by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    Hello(HelloMessage),
    HelloAck(HelloAckMessage),
    /// Token echoed back in the matching `Pong`; used for liveness and RTT.
    Ping(u64),
    Pong(u64),
    Disconnect { reason: LeaveReason },
    Command(CommandMessage),
    EntitySpawn(EntitySpawnMessage),
    EntityDestroy(EntityDestroyMessage),
    SceneLoad(SceneLoadMessage),
}

impl SessionMessage {
    /// Returns the [`MessageType`] discriminant for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            SessionMessage::Hello(_) => MessageType::Hello,
            SessionMessage::HelloAck(_) => MessageType::HelloAck,
            SessionMessage::Ping(_) => MessageType::Ping,
            SessionMessage::Pong(_) => MessageType::Pong,
            SessionMessage::Disconnect { .. } => MessageType::Disconnect,
            SessionMessage::Command(_) => MessageType::Command,
            SessionMessage::EntitySpawn(_) => MessageType::EntitySpawn,
            SessionMessage::EntityDestroy(_) => MessageType::EntityDestroy,
            SessionMessage::SceneLoad(_) => MessageType::SceneLoad,
        }
    }
}
