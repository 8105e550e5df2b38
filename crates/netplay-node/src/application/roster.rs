//! RosterServer: the session-scoped authoritative player registry.
//!
//! All roster traffic rides the director's command primitives, so the
//! roster inherits their delivery semantics for free – in particular, the
//! `player.register` broadcast is Buffered, which means a late joiner
//! replays the full roster history in order and converges on the same
//! member list as everyone else.
//!
//! Join handshake:
//!
//! ```text
//! client                          host
//! ──────                          ────
//! join.request {version}  ──►     validate version, check ban list
//!                         ◄──     join.accept {id}   (or join.deny {reason})
//! player.register {id, name} ─►   Buffered / All – everyone, forever
//! ```
//!
//! Disconnection (voluntary or detected by the transport) triggers a
//! Buffered `player.unregister` broadcast, so replayed history nets out for
//! peers who join after someone left.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use netplay_core::protocol::messages::{
    ArgKind, ArgValue, DispatchScope, DispatchTarget, Durability, PeerId,
};
use netplay_core::{BanEntry, ConnectError, PlayerId, PlayerRecord, TransportMode};

use crate::application::commands::{CommandError, CommandRegistry};
use crate::application::director::TransportDirector;

pub const CMD_JOIN_REQUEST: &str = "join.request";
pub const CMD_JOIN_ACCEPT: &str = "join.accept";
pub const CMD_JOIN_DENY: &str = "join.deny";
pub const CMD_PLAYER_REGISTER: &str = "player.register";
pub const CMD_PLAYER_UNREGISTER: &str = "player.unregister";

/// The player id a participating host assigns itself.
const HOST_PLAYER_ID: PlayerId = 0;

struct RosterState {
    players: HashMap<PlayerId, PlayerRecord>,
    /// Host side: which connected peer owns which player id.
    peer_players: HashMap<PeerId, PlayerId>,
    bans: HashSet<IpAddr>,
    next_player: PlayerId,
    local_player: Option<PlayerId>,
    game_version: String,
    display_name: String,
}

/// Authoritative player registry. The state sits behind a mutex only so the
/// registered command handlers can share it with the accessor methods; all
/// access happens on the tick thread.
pub struct RosterServer {
    state: Arc<Mutex<RosterState>>,
}

impl RosterServer {
    pub fn new(game_version: &str, display_name: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(RosterState {
                players: HashMap::new(),
                peer_players: HashMap::new(),
                bans: HashSet::new(),
                next_player: HOST_PLAYER_ID + 1,
                local_player: None,
                game_version: game_version.to_string(),
                display_name: display_name.to_string(),
            })),
        }
    }

    /// Adds the roster commands to the table. Call once at startup, before
    /// the director is constructed around the registry.
    pub fn install(&self, registry: &mut CommandRegistry) -> Result<(), CommandError> {
        let state = Arc::clone(&self.state);
        registry.register(
            CMD_JOIN_REQUEST,
            vec![ArgKind::Str],
            Box::new(move |origin, args, outbox| {
                if origin.is_local {
                    warn!("ignoring local join request; the host does not handshake");
                    return;
                }
                let ArgValue::Str(requested_version) = &args[0] else {
                    return;
                };

                let mut state = state.lock().unwrap();
                if *requested_version != state.game_version {
                    info!(
                        "denying join from peer {}: version {:?} != {:?}",
                        origin.sender, requested_version, state.game_version
                    );
                    outbox.dispatch(
                        DispatchTarget::Session,
                        CMD_JOIN_DENY,
                        vec![ArgValue::Str(
                            ConnectError::VersionMismatch.reason_str().to_string(),
                        )],
                        Durability::Transient,
                        DispatchScope::Single(origin.sender),
                    );
                    return;
                }
                if let Some(addr) = origin.remote_addr {
                    if state.bans.contains(&addr.ip()) {
                        info!("denying join from banned address {}", addr.ip());
                        outbox.dispatch(
                            DispatchTarget::Session,
                            CMD_JOIN_DENY,
                            vec![ArgValue::Str(
                                ConnectError::Banned.reason_str().to_string(),
                            )],
                            Durability::Transient,
                            DispatchScope::Single(origin.sender),
                        );
                        return;
                    }
                }

                let id = state.next_player;
                state.next_player += 1;
                state.peer_players.insert(origin.sender, id);
                outbox.dispatch(
                    DispatchTarget::Session,
                    CMD_JOIN_ACCEPT,
                    vec![ArgValue::Int(id as i32)],
                    Durability::Transient,
                    DispatchScope::Single(origin.sender),
                );
            }),
        )?;

        let state = Arc::clone(&self.state);
        registry.register(
            CMD_JOIN_ACCEPT,
            vec![ArgKind::Int],
            Box::new(move |_origin, args, outbox| {
                let ArgValue::Int(id) = &args[0] else { return };
                let id = *id as PlayerId;
                let display_name = {
                    let mut state = state.lock().unwrap();
                    state.local_player = Some(id);
                    state.display_name.clone()
                };
                info!("join accepted; registered as player {id}");
                // Buffered so every current and future peer replays this
                // registration in order.
                outbox.dispatch(
                    DispatchTarget::Session,
                    CMD_PLAYER_REGISTER,
                    vec![ArgValue::Int(id as i32), ArgValue::Str(display_name)],
                    Durability::Buffered,
                    DispatchScope::All,
                );
            }),
        )?;

        registry.register(
            CMD_JOIN_DENY,
            vec![ArgKind::Str],
            Box::new(move |_origin, args, outbox| {
                let ArgValue::Str(reason) = &args[0] else {
                    return;
                };
                let reason = ConnectError::from_reason_str(reason);
                warn!("join denied by host: {reason}");
                outbox.request_disconnect(reason);
            }),
        )?;

        let state = Arc::clone(&self.state);
        registry.register(
            CMD_PLAYER_REGISTER,
            vec![ArgKind::Int, ArgKind::Str],
            Box::new(move |_origin, args, _outbox| {
                let (ArgValue::Int(id), ArgValue::Str(name)) = (&args[0], &args[1]) else {
                    return;
                };
                let id = *id as PlayerId;
                let mut state = state.lock().unwrap();
                state.players.insert(
                    id,
                    PlayerRecord {
                        id,
                        display_name: name.clone(),
                    },
                );
                info!("player {id} ({name}) joined the roster");
            }),
        )?;

        let state = Arc::clone(&self.state);
        registry.register(
            CMD_PLAYER_UNREGISTER,
            vec![ArgKind::Int],
            Box::new(move |_origin, args, _outbox| {
                let ArgValue::Int(id) = &args[0] else { return };
                let id = *id as PlayerId;
                let mut state = state.lock().unwrap();
                if state.players.remove(&id).is_some() {
                    info!("player {id} left the roster");
                }
                state.peer_players.retain(|_, player| *player != id);
            }),
        )?;

        Ok(())
    }

    // ── Session lifecycle hooks (driven by the node context) ──────────────────

    /// Host path: after `HostStarted`, a participating host registers itself
    /// as player 0 with a buffered broadcast so every later joiner learns
    /// about it. A dedicated host holds no player record.
    pub fn on_session_started(&self, director: &mut TransportDirector) {
        if director.mode() != TransportMode::Hosting {
            return;
        }
        if director.is_dedicated() {
            return;
        }
        let display_name = {
            let mut state = self.state.lock().unwrap();
            state.local_player = Some(HOST_PLAYER_ID);
            state.display_name.clone()
        };
        if let Err(e) = director.dispatch(
            DispatchTarget::Session,
            CMD_PLAYER_REGISTER,
            vec![
                ArgValue::Int(HOST_PLAYER_ID as i32),
                ArgValue::Str(display_name),
            ],
            Durability::Buffered,
            DispatchScope::All,
        ) {
            warn!("failed to register host player: {e}");
        }
    }

    /// Client path: after `Connected`, start the join handshake.
    pub fn on_connected(&self, director: &mut TransportDirector) {
        let version = self.state.lock().unwrap().game_version.clone();
        if let Err(e) = director.dispatch(
            DispatchTarget::Session,
            CMD_JOIN_REQUEST,
            vec![ArgValue::Str(version)],
            Durability::Transient,
            DispatchScope::Server,
        ) {
            warn!("failed to send join request: {e}");
        }
    }

    /// Host path: a peer's transport connection is gone; broadcast its
    /// unregistration.
    pub fn on_peer_left(&self, director: &mut TransportDirector, peer: PeerId) {
        if director.mode() != TransportMode::Hosting {
            return;
        }
        let player = self.state.lock().unwrap().peer_players.remove(&peer);
        let Some(player) = player else { return };
        if let Err(e) = director.dispatch(
            DispatchTarget::Session,
            CMD_PLAYER_UNREGISTER,
            vec![ArgValue::Int(player as i32)],
            Durability::Buffered,
            DispatchScope::All,
        ) {
            warn!("failed to unregister player {player}: {e}");
        }
    }

    /// The session ended in any way. A player record exists only while the
    /// session is `Hosting` or `Client`, and bans are session-lifetime.
    pub fn on_session_ended(&self) {
        let mut state = self.state.lock().unwrap();
        state.players.clear();
        state.peer_players.clear();
        state.local_player = None;
        state.bans.clear();
        state.next_player = HOST_PLAYER_ID + 1;
    }

    /// Disconnects a player's peer; with `ban`, its address is refused for
    /// the rest of the session. Host only.
    pub fn kick(&self, director: &mut TransportDirector, player: PlayerId, ban: bool) -> bool {
        if director.mode() != TransportMode::Hosting {
            return false;
        }
        let peer = {
            let state = self.state.lock().unwrap();
            state
                .peer_players
                .iter()
                .find(|(_, p)| **p == player)
                .map(|(peer, _)| *peer)
        };
        let Some(peer) = peer else {
            warn!("kick: no connected peer owns player {player}");
            return false;
        };

        if ban {
            if let Some(addr) = director.peer_addr(peer) {
                self.ban_address(addr.ip());
            }
        }
        info!("kicking player {player} (peer {peer}, ban: {ban})");
        // The PeerLeft completion triggers the unregister broadcast.
        director.kick_peer(peer)
    }

    pub fn ban_address(&self, ip: IpAddr) {
        self.state.lock().unwrap().bans.insert(ip);
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.state.lock().unwrap().bans.contains(&ip)
    }

    pub fn ban_entries(&self) -> Vec<BanEntry> {
        self.state
            .lock()
            .unwrap()
            .bans
            .iter()
            .map(|ip| BanEntry { ip_address: *ip })
            .collect()
    }

    pub fn players(&self) -> Vec<PlayerRecord> {
        self.state.lock().unwrap().players.values().cloned().collect()
    }

    pub fn player_count(&self) -> usize {
        self.state.lock().unwrap().players.len()
    }

    pub fn local_player(&self) -> Option<PlayerId> {
        self.state.lock().unwrap().local_player
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
