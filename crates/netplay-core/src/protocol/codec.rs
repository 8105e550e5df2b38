//! Binary codec for session frames.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][reserved:2][payload_len:4][seq:8][scene_prefix:4][payload:N]
//! ```
//! Total header size: 20 bytes. All multi-byte integers are big-endian.
//!
//! The scene prefix rides in the header rather than in each payload so the
//! receiver can fence stale session frames before decoding them. Transport
//! frames carry a prefix of 0 and are never fenced.

use thiserror::Error;

use crate::protocol::messages::{
    ArgValue, CommandMessage, DispatchScope, DispatchTarget, Durability, EntityDestroyMessage,
    EntityId, EntitySpawnMessage, HelloAckMessage, HelloMessage, LeaveReason, MessageType,
    SceneLoadMessage, SessionMessage, HEADER_SIZE, PROTOCOL_VERSION,
};

use crate::domain::session::ConnectError;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The encoded payload length field does not match the data available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },
}

/// One decoded frame: the header fields the receiver needs plus the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Sender's monotonically increasing frame counter.
    pub seq: u64,
    /// Scene fence the frame was sent under; 0 for transport frames.
    pub scene_prefix: u32,
    pub message: SessionMessage,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`SessionMessage`] into a byte vector including the header.
///
/// The sequence number is not produced here – pass a pre-incremented value
/// from a [`crate::protocol::SequenceCounter`].
///
/// # Errors
///
/// Returns [`CodecError`] if serialization fails.
pub fn encode_frame(
    msg: &SessionMessage,
    seq: u64,
    scene_prefix: u32,
) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(msg)?;
    let payload_len = payload.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());

    buf.push(PROTOCOL_VERSION);
    buf.push(msg.message_type() as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&scene_prefix.to_be_bytes());

    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the decoded frame and the total number of bytes consumed (header
/// plus payload) so the caller can advance its read cursor.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let msg_type_byte = bytes[1];
    let msg_type = MessageType::try_from(msg_type_byte)
        .map_err(|_| CodecError::UnknownMessageType(msg_type_byte))?;

    // bytes[2..4] are reserved – ignored on decode

    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(CodecError::PayloadLengthMismatch {
            declared: payload_len,
            available: bytes.len() - HEADER_SIZE,
        });
    }

    let seq = read_u64(bytes, 8)?;
    let scene_prefix = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];
    let message = decode_payload(msg_type, payload)?;
    Ok((
        Frame {
            seq,
            scene_prefix,
            message,
        },
        total_needed,
    ))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &SessionMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    match msg {
        SessionMessage::Hello(m) => encode_hello(&mut buf, m),
        SessionMessage::HelloAck(m) => encode_hello_ack(&mut buf, m),
        SessionMessage::Ping(token) => buf.extend_from_slice(&token.to_be_bytes()),
        SessionMessage::Pong(token) => buf.extend_from_slice(&token.to_be_bytes()),
        SessionMessage::Disconnect { reason } => buf.push(*reason as u8),
        SessionMessage::Command(m) => encode_command(&mut buf, m),
        SessionMessage::EntitySpawn(m) => encode_entity_spawn(&mut buf, m),
        SessionMessage::EntityDestroy(m) => encode_entity_id(&mut buf, m.entity),
        SessionMessage::SceneLoad(m) => encode_scene_load(&mut buf, m),
    }
    Ok(buf)
}

fn encode_hello(buf: &mut Vec<u8>, m: &HelloMessage) {
    buf.push(m.protocol_version);
    write_length_prefixed_string(buf, &m.password);
    write_length_prefixed_string(buf, &m.display_name);
}

fn encode_hello_ack(buf: &mut Vec<u8>, m: &HelloAckMessage) {
    buf.push(if m.accepted { 0x01 } else { 0x00 });
    buf.push(m.reason as u8);
    buf.extend_from_slice(&m.peer_id.to_be_bytes());
    buf.extend_from_slice(&m.scene_prefix.to_be_bytes());
}

fn encode_entity_id(buf: &mut Vec<u8>, id: EntityId) {
    buf.extend_from_slice(&id.owner.to_be_bytes());
    buf.extend_from_slice(&id.index.to_be_bytes());
}

fn encode_target(buf: &mut Vec<u8>, target: DispatchTarget) {
    match target {
        DispatchTarget::Session => buf.push(0x00),
        DispatchTarget::Entity(id) => {
            buf.push(0x01);
            encode_entity_id(buf, id);
        }
    }
}

fn encode_scope(buf: &mut Vec<u8>, scope: DispatchScope) {
    match scope {
        DispatchScope::All => buf.push(0x01),
        DispatchScope::Server => buf.push(0x02),
        DispatchScope::Single(peer) => {
            buf.push(0x03);
            buf.extend_from_slice(&peer.to_be_bytes());
        }
    }
}

fn encode_arg(buf: &mut Vec<u8>, arg: &ArgValue) {
    match arg {
        ArgValue::Bool(v) => {
            buf.push(0x01);
            buf.push(if *v { 0x01 } else { 0x00 });
        }
        ArgValue::Int(v) => {
            buf.push(0x02);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        ArgValue::Float(v) => {
            buf.push(0x03);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        ArgValue::Str(v) => {
            buf.push(0x04);
            write_length_prefixed_string(buf, v);
        }
        ArgValue::Vec3(v) => {
            buf.push(0x05);
            for component in v {
                buf.extend_from_slice(&component.to_be_bytes());
            }
        }
        ArgValue::Quat(v) => {
            buf.push(0x06);
            for component in v {
                buf.extend_from_slice(&component.to_be_bytes());
            }
        }
    }
}

fn encode_command(buf: &mut Vec<u8>, m: &CommandMessage) {
    buf.extend_from_slice(&m.sender.to_be_bytes());
    encode_target(buf, m.target);
    write_length_prefixed_string(buf, &m.name);
    buf.extend_from_slice(&(m.args.len() as u16).to_be_bytes());
    for arg in &m.args {
        encode_arg(buf, arg);
    }
    buf.push(m.durability as u8);
    encode_scope(buf, m.scope);
}

fn encode_entity_spawn(buf: &mut Vec<u8>, m: &EntitySpawnMessage) {
    encode_entity_id(buf, m.entity);
    write_length_prefixed_string(buf, &m.descriptor);
    for component in &m.position {
        buf.extend_from_slice(&component.to_be_bytes());
    }
    for component in &m.rotation {
        buf.extend_from_slice(&component.to_be_bytes());
    }
    buf.push(m.group);
}

fn encode_scene_load(buf: &mut Vec<u8>, m: &SceneLoadMessage) {
    write_length_prefixed_string(buf, &m.scene_name);
    buf.extend_from_slice(&m.scene_prefix.to_be_bytes());
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<SessionMessage, CodecError> {
    match msg_type {
        MessageType::Hello => decode_hello(payload).map(SessionMessage::Hello),
        MessageType::HelloAck => decode_hello_ack(payload).map(SessionMessage::HelloAck),
        MessageType::Ping => {
            let token = read_u64(payload, 0)?;
            Ok(SessionMessage::Ping(token))
        }
        MessageType::Pong => {
            let token = read_u64(payload, 0)?;
            Ok(SessionMessage::Pong(token))
        }
        MessageType::Disconnect => {
            require_len(payload, 1, "Disconnect")?;
            let reason = LeaveReason::try_from(payload[0]).map_err(|_| {
                CodecError::MalformedPayload(format!("unknown leave reason: {}", payload[0]))
            })?;
            Ok(SessionMessage::Disconnect { reason })
        }
        MessageType::Command => decode_command(payload).map(SessionMessage::Command),
        MessageType::EntitySpawn => decode_entity_spawn(payload).map(SessionMessage::EntitySpawn),
        MessageType::EntityDestroy => {
            let (entity, _) = read_entity_id(payload, 0)?;
            Ok(SessionMessage::EntityDestroy(EntityDestroyMessage {
                entity,
            }))
        }
        MessageType::SceneLoad => decode_scene_load(payload).map(SessionMessage::SceneLoad),
    }
}

fn decode_hello(p: &[u8]) -> Result<HelloMessage, CodecError> {
    require_len(p, 1, "Hello")?;
    let protocol_version = p[0];
    let (password, after_password) = read_length_prefixed_string(p, 1)?;
    let (display_name, _) = read_length_prefixed_string(p, after_password)?;
    Ok(HelloMessage {
        protocol_version,
        password,
        display_name,
    })
}

fn decode_hello_ack(p: &[u8]) -> Result<HelloAckMessage, CodecError> {
    // 1 (accepted) + 1 (reason) + 4 (peer_id) + 4 (scene_prefix)
    require_len(p, 10, "HelloAck")?;
    let accepted = p[0] != 0;
    let reason = ConnectError::try_from(p[1])
        .map_err(|_| CodecError::MalformedPayload(format!("unknown connect error: {}", p[1])))?;
    let peer_id = u32::from_be_bytes([p[2], p[3], p[4], p[5]]);
    let scene_prefix = u32::from_be_bytes([p[6], p[7], p[8], p[9]]);
    Ok(HelloAckMessage {
        accepted,
        reason,
        peer_id,
        scene_prefix,
    })
}

fn read_entity_id(p: &[u8], offset: usize) -> Result<(EntityId, usize), CodecError> {
    require_len(p, offset + 8, "EntityId")?;
    let owner = u32::from_be_bytes([p[offset], p[offset + 1], p[offset + 2], p[offset + 3]]);
    let index = u32::from_be_bytes([
        p[offset + 4],
        p[offset + 5],
        p[offset + 6],
        p[offset + 7],
    ]);
    Ok((EntityId { owner, index }, offset + 8))
}

fn read_target(p: &[u8], offset: usize) -> Result<(DispatchTarget, usize), CodecError> {
    require_len(p, offset + 1, "DispatchTarget")?;
    match p[offset] {
        0x00 => Ok((DispatchTarget::Session, offset + 1)),
        0x01 => {
            let (entity, end) = read_entity_id(p, offset + 1)?;
            Ok((DispatchTarget::Entity(entity), end))
        }
        other => Err(CodecError::MalformedPayload(format!(
            "unknown dispatch target tag: {other}"
        ))),
    }
}

fn read_scope(p: &[u8], offset: usize) -> Result<(DispatchScope, usize), CodecError> {
    require_len(p, offset + 1, "DispatchScope")?;
    match p[offset] {
        0x01 => Ok((DispatchScope::All, offset + 1)),
        0x02 => Ok((DispatchScope::Server, offset + 1)),
        0x03 => {
            require_len(p, offset + 5, "DispatchScope::Single")?;
            let peer = u32::from_be_bytes([
                p[offset + 1],
                p[offset + 2],
                p[offset + 3],
                p[offset + 4],
            ]);
            Ok((DispatchScope::Single(peer), offset + 5))
        }
        other => Err(CodecError::MalformedPayload(format!(
            "unknown dispatch scope tag: {other}"
        ))),
    }
}

fn read_arg(p: &[u8], offset: usize) -> Result<(ArgValue, usize), CodecError> {
    require_len(p, offset + 1, "ArgValue tag")?;
    let tag = p[offset];
    let off = offset + 1;
    match tag {
        0x01 => {
            require_len(p, off + 1, "ArgValue::Bool")?;
            Ok((ArgValue::Bool(p[off] != 0), off + 1))
        }
        0x02 => {
            require_len(p, off + 4, "ArgValue::Int")?;
            let v = i32::from_be_bytes([p[off], p[off + 1], p[off + 2], p[off + 3]]);
            Ok((ArgValue::Int(v), off + 4))
        }
        0x03 => {
            let (v, end) = read_f32(p, off)?;
            Ok((ArgValue::Float(v), end))
        }
        0x04 => {
            let (v, end) = read_length_prefixed_string(p, off)?;
            Ok((ArgValue::Str(v), end))
        }
        0x05 => {
            let mut components = [0f32; 3];
            let mut cursor = off;
            for component in &mut components {
                let (v, end) = read_f32(p, cursor)?;
                *component = v;
                cursor = end;
            }
            Ok((ArgValue::Vec3(components), cursor))
        }
        0x06 => {
            let mut components = [0f32; 4];
            let mut cursor = off;
            for component in &mut components {
                let (v, end) = read_f32(p, cursor)?;
                *component = v;
                cursor = end;
            }
            Ok((ArgValue::Quat(components), cursor))
        }
        other => Err(CodecError::MalformedPayload(format!(
            "unknown argument tag: {other}"
        ))),
    }
}

fn decode_command(p: &[u8]) -> Result<CommandMessage, CodecError> {
    require_len(p, 4, "Command")?;
    let sender = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
    let (target, after_target) = read_target(p, 4)?;
    let (name, after_name) = read_length_prefixed_string(p, after_target)?;

    require_len(p, after_name + 2, "Command arg count")?;
    let arg_count = u16::from_be_bytes([p[after_name], p[after_name + 1]]) as usize;
    let mut args = Vec::with_capacity(arg_count);
    let mut cursor = after_name + 2;
    for _ in 0..arg_count {
        let (arg, end) = read_arg(p, cursor)?;
        args.push(arg);
        cursor = end;
    }

    require_len(p, cursor + 1, "Command durability")?;
    let durability = Durability::try_from(p[cursor]).map_err(|_| {
        CodecError::MalformedPayload(format!("unknown durability: {}", p[cursor]))
    })?;
    let (scope, _) = read_scope(p, cursor + 1)?;

    Ok(CommandMessage {
        sender,
        target,
        name,
        args,
        durability,
        scope,
    })
}

fn decode_entity_spawn(p: &[u8]) -> Result<EntitySpawnMessage, CodecError> {
    let (entity, after_id) = read_entity_id(p, 0)?;
    let (descriptor, after_descriptor) = read_length_prefixed_string(p, after_id)?;

    let mut position = [0f32; 3];
    let mut cursor = after_descriptor;
    for component in &mut position {
        let (v, end) = read_f32(p, cursor)?;
        *component = v;
        cursor = end;
    }
    let mut rotation = [0f32; 4];
    for component in &mut rotation {
        let (v, end) = read_f32(p, cursor)?;
        *component = v;
        cursor = end;
    }
    require_len(p, cursor + 1, "EntitySpawn.group")?;
    let group = p[cursor];

    Ok(EntitySpawnMessage {
        entity,
        descriptor,
        position,
        rotation,
        group,
    })
}

fn decode_scene_load(p: &[u8]) -> Result<SceneLoadMessage, CodecError> {
    let (scene_name, after_name) = read_length_prefixed_string(p, 0)?;
    require_len(p, after_name + 4, "SceneLoad.prefix")?;
    let scene_prefix = u32::from_be_bytes([
        p[after_name],
        p[after_name + 1],
        p[after_name + 2],
        p[after_name + 3],
    ]);
    Ok(SceneLoadMessage {
        scene_name,
        scene_prefix,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), CodecError> {
    if buf.len() < needed {
        Err(CodecError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, CodecError> {
    if buf.len() < offset + 8 {
        return Err(CodecError::InsufficientData {
            needed: offset + 8,
            available: buf.len(),
        });
    }
    Ok(u64::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ]))
}

fn read_f32(buf: &[u8], offset: usize) -> Result<(f32, usize), CodecError> {
    require_len(buf, offset + 4, "f32")?;
    let v = f32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]);
    Ok((v, offset + 4))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize) as u16;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&bytes[..len as usize]);
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), CodecError> {
    if buf.len() < offset + 2 {
        return Err(CodecError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(CodecError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| CodecError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &SessionMessage) -> Frame {
        let encoded = encode_frame(msg, 7, 3).expect("encode failed");
        let (frame, consumed) = decode_frame(&encoded).expect("decode failed");
        assert_eq!(consumed, encoded.len(), "consumed must equal total size");
        frame
    }

    #[test]
    fn test_hello_round_trip() {
        let msg = SessionMessage::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            password: "hunter2".to_string(),
            display_name: "ada".to_string(),
        });
        assert_eq!(round_trip(&msg).message, msg);
    }

    #[test]
    fn test_hello_with_empty_password_round_trip() {
        let msg = SessionMessage::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            password: String::new(),
            display_name: "ada".to_string(),
        });
        assert_eq!(round_trip(&msg).message, msg);
    }

    #[test]
    fn test_hello_ack_rejected_round_trip() {
        let msg = SessionMessage::HelloAck(HelloAckMessage {
            accepted: false,
            reason: ConnectError::Refused,
            peer_id: 0,
            scene_prefix: 0,
        });
        assert_eq!(round_trip(&msg).message, msg);
    }

    #[test]
    fn test_hello_ack_accepted_carries_fence() {
        let msg = SessionMessage::HelloAck(HelloAckMessage {
            accepted: true,
            reason: ConnectError::NoError,
            peer_id: 6,
            scene_prefix: 12,
        });
        match round_trip(&msg).message {
            SessionMessage::HelloAck(ack) => {
                assert_eq!(ack.peer_id, 6);
                assert_eq!(ack.scene_prefix, 12);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_command_with_mixed_args_round_trip() {
        let msg = SessionMessage::Command(CommandMessage {
            sender: 2,
            target: DispatchTarget::Entity(EntityId { owner: 1, index: 9 }),
            name: "weapon.fire".to_string(),
            args: vec![
                ArgValue::Bool(true),
                ArgValue::Int(-40),
                ArgValue::Float(0.25),
                ArgValue::Str("plasma".to_string()),
                ArgValue::Vec3([1.0, 2.0, 3.0]),
                ArgValue::Quat([0.0, 0.0, 0.0, 1.0]),
            ],
            durability: Durability::Transient,
            scope: DispatchScope::All,
        });
        assert_eq!(round_trip(&msg).message, msg);
    }

    #[test]
    fn test_command_single_scope_carries_peer_id() {
        let msg = SessionMessage::Command(CommandMessage {
            sender: 0,
            target: DispatchTarget::Session,
            name: "join.accept".to_string(),
            args: vec![ArgValue::Int(4)],
            durability: Durability::Transient,
            scope: DispatchScope::Single(4),
        });
        let frame = round_trip(&msg);
        match frame.message {
            SessionMessage::Command(cmd) => assert_eq!(cmd.scope, DispatchScope::Single(4)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_entity_spawn_round_trip() {
        let msg = SessionMessage::EntitySpawn(EntitySpawnMessage {
            entity: EntityId { owner: 3, index: 1 },
            descriptor: "props/crate".to_string(),
            position: [10.0, 0.0, -4.5],
            rotation: [0.0, 0.7071, 0.0, 0.7071],
            group: 2,
        });
        assert_eq!(round_trip(&msg).message, msg);
    }

    #[test]
    fn test_scene_load_round_trip() {
        let msg = SessionMessage::SceneLoad(SceneLoadMessage {
            scene_name: "arena02".to_string(),
            scene_prefix: 5,
        });
        assert_eq!(round_trip(&msg).message, msg);
    }

    #[test]
    fn test_disconnect_round_trip() {
        let msg = SessionMessage::Disconnect {
            reason: LeaveReason::Kicked,
        };
        assert_eq!(round_trip(&msg).message, msg);
    }

    #[test]
    fn test_header_carries_seq_and_scene_prefix() {
        let bytes = encode_frame(&SessionMessage::Ping(0), 0x0102_0304_0506_0708, 42).unwrap();
        let (frame, _) = decode_frame(&bytes).unwrap();
        assert_eq!(frame.seq, 0x0102_0304_0506_0708);
        assert_eq!(frame.scene_prefix, 42);
    }

    #[test]
    fn test_ping_frame_is_exactly_header_plus_token() {
        let bytes = encode_frame(&SessionMessage::Ping(1), 0, 0).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_decode_empty_bytes_returns_insufficient_data() {
        let result = decode_frame(&[]);
        assert!(matches!(result, Err(CodecError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_wrong_version_returns_error() {
        let mut bytes = encode_frame(&SessionMessage::Ping(1), 0, 0).unwrap();
        bytes[0] = 0x7F;
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::UnsupportedVersion(0x7F))
        ));
    }

    #[test]
    fn test_decode_unknown_message_type_returns_error() {
        let mut bytes = encode_frame(&SessionMessage::Ping(1), 0, 0).unwrap();
        bytes[1] = 0xEE;
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn test_decode_truncated_payload_returns_length_mismatch() {
        let bytes = encode_frame(
            &SessionMessage::SceneLoad(SceneLoadMessage {
                scene_name: "arena02".to_string(),
                scene_prefix: 1,
            }),
            0,
            1,
        )
        .unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode_frame(truncated),
            Err(CodecError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_garbage_argument_tag_is_malformed() {
        let msg = SessionMessage::Command(CommandMessage {
            sender: 0,
            target: DispatchTarget::Session,
            name: "x".to_string(),
            args: vec![ArgValue::Bool(true)],
            durability: Durability::Buffered,
            scope: DispatchScope::All,
        });
        let mut bytes = encode_frame(&msg, 0, 0).unwrap();
        // The argument tag sits after: sender(4) + target(1) + name(2+1) + count(2).
        let tag_offset = HEADER_SIZE + 4 + 1 + 3 + 2;
        bytes[tag_offset] = 0x7E;
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::MalformedPayload(_))
        ));
    }
}
