//! TransportDirector: the transport-mode state machine.
//!
//! Gameplay code talks to exactly one object regardless of whether the
//! session is offline, hosting, dedicated-hosting, or connected as a
//! client. Entity creation, command dispatch, and scene loads have the same
//! caller-visible contract in every mode; only the replication behind them
//! changes.
//!
//! State machine (no other transition is legal):
//!
//! ```text
//! Idle ──host_session──► Connecting ──bind ok───► Hosting
//! Idle ──connect─────────► Connecting ──hello ok─► Client
//!                          Connecting ──failure──► Idle
//! Hosting | Client ──disconnect (either side)────► Idle
//! ```
//!
//! State-violating calls fail fast with [`DirectorError::ModeViolation`];
//! network-level failures never surface as errors from these methods –
//! they arrive as [`DirectorEvent`]s on the channel returned by
//! [`TransportDirector::new`], on a later tick.
//!
//! All mutation happens on the tick thread. The session link marshals its
//! completions onto [`TransportDirector::tick`] through a channel; the
//! director never blocks on a socket.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use netplay_core::protocol::messages::{
    ArgValue, CommandMessage, DispatchScope, DispatchTarget, Durability, EntityDestroyMessage,
    EntityId, EntitySpawnMessage, HelloMessage, LeaveReason, PeerId, SceneLoadMessage,
    HOST_PEER_ID, PROTOCOL_VERSION,
};
use netplay_core::{ConnectError, HostScope, Session, SessionMessage, TransportMode};

use crate::application::commands::{CommandError, CommandRegistry, DispatchOrigin, Outbox};
use crate::infrastructure::link::{ClientLink, HostLink, HostSettings, LinkEvent};

/// Error type for director operations. Only contract violations surface
/// here; network failures are events.
#[derive(Debug, Error, PartialEq)]
pub enum DirectorError {
    /// The operation is not legal in the current transport mode. Programmer
    /// error – detected and reported immediately, never silently ignored.
    #[error("{operation} is not valid while {mode}")]
    ModeViolation {
        operation: &'static str,
        mode: TransportMode,
    },

    /// A command-table error (unknown name, schema mismatch).
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Parameters for [`TransportDirector::host_session`].
#[derive(Debug, Clone)]
pub struct HostParams {
    pub max_peers: usize,
    /// Port to listen on; 0 lets the OS pick (the bound port arrives in
    /// `HostStarted`).
    pub port: u16,
    /// Host without participating as a player.
    pub dedicated: bool,
    pub password: String,
    pub scope: HostScope,
    pub session_name: String,
}

/// Asynchronous results reported to the caller. Callers awaiting
/// `host_session` / `connect_to_session` outcomes do not block; the result
/// arrives here on a later tick.
#[derive(Debug, Clone)]
pub enum DirectorEvent {
    HostStarted {
        port: u16,
    },
    HostFailed {
        reason: ConnectError,
        detail: String,
    },
    Connected {
        assigned_peer: PeerId,
    },
    ConnectFailed {
        reason: ConnectError,
    },
    Disconnected {
        reason: LeaveReason,
    },
    PeerJoined {
        peer: PeerId,
        addr: SocketAddr,
    },
    PeerLeft {
        peer: PeerId,
        reason: LeaveReason,
    },
    /// A join handshake ended in rejection; the session was torn down.
    JoinRejected {
        reason: ConnectError,
    },
    /// The gameplay layer should load this scene now. Emitted locally on
    /// `load_scene` and on a client when the host's scene load arrives.
    SceneLoaded {
        scene_name: String,
        scene_prefix: u32,
    },
}

/// Timing knobs for the director.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Name sent in the transport hello and registered in the roster.
    pub display_name: String,
    pub connect_timeout: Duration,
    /// How often the host pings each peer.
    pub ping_interval: Duration,
    /// Silence threshold after which a peer (or the host) counts as gone.
    pub ping_timeout: Duration,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            display_name: "player".to_string(),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport-level bookkeeping for one replicated entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: EntityId,
    pub descriptor: String,
    pub group: u8,
}

struct PeerState {
    addr: SocketAddr,
    last_seen: Instant,
    outstanding_ping: Option<(u64, Instant)>,
    rtt: Option<Duration>,
}

enum ActiveLink {
    None,
    Host(HostLink),
    Client(ClientLink),
}

pub struct TransportDirector {
    config: DirectorConfig,
    session: Session,
    registry: CommandRegistry,
    link: ActiveLink,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    events: mpsc::UnboundedSender<DirectorEvent>,
    pending_host: Option<HostParams>,
    local_peer: PeerId,
    peers: HashMap<PeerId, PeerState>,
    /// Host-side retained log: every buffered dispatch, spawn, and scene
    /// load in global send order, each with the scene prefix it was sent
    /// under. Replayed verbatim to late joiners.
    buffered: Vec<(SessionMessage, u32)>,
    entities: HashMap<EntityId, EntityRecord>,
    next_entity_index: u32,
    host_last_seen: Instant,
    last_ping_round: Instant,
    next_ping_token: u64,
}

impl TransportDirector {
    /// Creates the director and returns it together with its event channel.
    pub fn new(
        config: DirectorConfig,
        registry: CommandRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<DirectorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let director = Self {
            config,
            session: Session::new(),
            registry,
            link: ActiveLink::None,
            link_tx,
            link_rx,
            events: events_tx,
            pending_host: None,
            local_peer: HOST_PEER_ID,
            peers: HashMap::new(),
            buffered: Vec::new(),
            entities: HashMap::new(),
            next_entity_index: 0,
            host_last_seen: now,
            last_ping_round: now,
            next_ping_token: 0,
        };
        (director, events_rx)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn mode(&self) -> TransportMode {
        self.session.mode()
    }

    pub fn scene_prefix(&self) -> u32 {
        self.session.scene_prefix()
    }

    pub fn host_scope(&self) -> HostScope {
        self.session.scope()
    }

    pub fn is_dedicated(&self) -> bool {
        self.session.is_dedicated()
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// The command table. Gameplay registers its commands here at startup.
    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(&peer).map(|p| p.addr)
    }

    /// Last measured round trip to a peer, host side.
    pub fn peer_rtt(&self, peer: PeerId) -> Option<Duration> {
        self.peers.get(&peer).and_then(|p| p.rtt)
    }

    // ── Session transitions ───────────────────────────────────────────────────

    /// Starts hosting. Valid only from `Idle`; moves to `Connecting`
    /// immediately. Exactly one bind attempt is in flight at a time – a
    /// second call before the outcome arrives is a `ModeViolation`.
    pub fn host_session(&mut self, params: HostParams) -> Result<(), DirectorError> {
        if self.session.mode() != TransportMode::Idle {
            return Err(DirectorError::ModeViolation {
                operation: "host_session",
                mode: self.session.mode(),
            });
        }
        info!(
            "hosting {:?} on port {} (max {} peers, {:?})",
            params.session_name, params.port, params.max_peers, params.scope
        );
        self.session.begin_connecting();
        let link = HostLink::spawn(
            params.port,
            HostSettings {
                password: params.password.clone(),
                max_peers: params.max_peers,
            },
            self.link_tx.clone(),
        );
        self.link = ActiveLink::Host(link);
        self.pending_host = Some(params);
        Ok(())
    }

    /// Connects to a remote host. Valid only from `Idle`.
    pub fn connect_to_session(
        &mut self,
        address: IpAddr,
        port: u16,
        password: &str,
    ) -> Result<(), DirectorError> {
        if self.session.mode() != TransportMode::Idle {
            return Err(DirectorError::ModeViolation {
                operation: "connect_to_session",
                mode: self.session.mode(),
            });
        }
        let addr = SocketAddr::new(address, port);
        info!("connecting to {addr}");
        self.session.begin_connecting();
        let hello = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            password: password.to_string(),
            display_name: self.config.display_name.clone(),
        };
        let link = ClientLink::spawn(addr, hello, self.config.connect_timeout, self.link_tx.clone());
        self.link = ActiveLink::Client(link);
        Ok(())
    }

    /// Tears the session down. Valid from `Connecting`, `Hosting`, and
    /// `Client`.
    pub fn disconnect(&mut self) -> Result<(), DirectorError> {
        if self.session.mode() == TransportMode::Idle {
            return Err(DirectorError::ModeViolation {
                operation: "disconnect",
                mode: self.session.mode(),
            });
        }
        self.teardown(LeaveReason::UserInitiated);
        Ok(())
    }

    // ── Uniform operations ────────────────────────────────────────────────────

    /// Creates an entity: locally when `Idle`, replicated (and buffered for
    /// late joiners) when networked. The contract is identical either way.
    pub fn instantiate(
        &mut self,
        descriptor: &str,
        position: [f32; 3],
        rotation: [f32; 4],
        group: u8,
    ) -> Result<EntityId, DirectorError> {
        let mode = self.session.mode();
        if mode == TransportMode::Connecting {
            return Err(DirectorError::ModeViolation {
                operation: "instantiate",
                mode,
            });
        }

        self.next_entity_index += 1;
        let id = EntityId {
            owner: self.local_peer,
            index: self.next_entity_index,
        };
        self.entities.insert(
            id,
            EntityRecord {
                id,
                descriptor: descriptor.to_string(),
                group,
            },
        );

        if mode.is_networked() {
            let prefix = self.session.scene_prefix();
            let spawn = EntitySpawnMessage {
                entity: id,
                descriptor: descriptor.to_string(),
                position,
                rotation,
                group,
            };
            match (&self.link, mode) {
                (ActiveLink::Host(link), TransportMode::Hosting) => {
                    self.buffered
                        .push((SessionMessage::EntitySpawn(spawn.clone()), prefix));
                    link.broadcast(&SessionMessage::EntitySpawn(spawn), prefix);
                }
                (ActiveLink::Client(link), TransportMode::Client) => {
                    link.send(&SessionMessage::EntitySpawn(spawn), prefix);
                }
                _ => {}
            }
        }
        Ok(id)
    }

    /// Destroys an entity. Any peer may destroy an entity it does not own –
    /// ownership is the caller's contract, not the transport's. The
    /// matching buffered spawn is dropped so late joiners never see the
    /// entity.
    pub fn destroy(&mut self, entity: EntityId) -> Result<(), DirectorError> {
        let mode = self.session.mode();
        if mode == TransportMode::Connecting {
            return Err(DirectorError::ModeViolation {
                operation: "destroy",
                mode,
            });
        }

        if self.entities.remove(&entity).is_none() {
            // Normal under destroy races with remote peers.
            debug!("destroy of unknown entity {entity}");
        }

        if mode.is_networked() {
            let prefix = self.session.scene_prefix();
            let msg = SessionMessage::EntityDestroy(EntityDestroyMessage { entity });
            match (&self.link, mode) {
                (ActiveLink::Host(link), TransportMode::Hosting) => {
                    self.buffered.retain(|(buffered, _)| {
                        !matches!(buffered, SessionMessage::EntitySpawn(s) if s.entity == entity)
                    });
                    link.broadcast(&msg, prefix);
                }
                (ActiveLink::Client(link), TransportMode::Client) => {
                    link.send(&msg, prefix);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Dispatches a named command. In local mode the handler runs
    /// synchronously; networked, an equivalent remote call is issued.
    ///
    /// Only `All`-scoped dispatches are retained by `Buffered` durability;
    /// `Server` and `Single` deliveries have no late joiner to replay to.
    pub fn dispatch(
        &mut self,
        target: DispatchTarget,
        name: &str,
        args: Vec<ArgValue>,
        durability: Durability,
        scope: DispatchScope,
    ) -> Result<(), DirectorError> {
        let mode = self.session.mode();
        if mode == TransportMode::Connecting {
            return Err(DirectorError::ModeViolation {
                operation: "dispatch",
                mode,
            });
        }

        let execute_locally = match scope {
            DispatchScope::All => true,
            // Acting alone, the local peer is the authority.
            DispatchScope::Server => mode != TransportMode::Client,
            DispatchScope::Single(peer) => peer == self.local_peer || mode == TransportMode::Idle,
        };

        if execute_locally {
            let origin = DispatchOrigin {
                sender: self.local_peer,
                remote_addr: None,
                target,
                is_local: true,
            };
            let mut outbox = Outbox::new();
            self.registry.invoke(name, &origin, &args, &mut outbox)?;
            self.flush_outbox(outbox);
        } else {
            // Still validate against the local table: the command contract
            // is shared by every peer, so a mismatch here is our bug.
            self.registry.validate(name, &args)?;
        }

        if mode.is_networked() {
            let prefix = self.session.scene_prefix();
            let cmd = CommandMessage {
                sender: self.local_peer,
                target,
                name: name.to_string(),
                args,
                durability,
                scope,
            };
            match mode {
                TransportMode::Hosting => match scope {
                    DispatchScope::All => {
                        if durability == Durability::Buffered {
                            self.buffered
                                .push((SessionMessage::Command(cmd.clone()), prefix));
                        }
                        if let ActiveLink::Host(link) = &self.link {
                            link.broadcast(&SessionMessage::Command(cmd), prefix);
                        }
                    }
                    DispatchScope::Server => {}
                    DispatchScope::Single(peer) => {
                        if peer != self.local_peer {
                            if let ActiveLink::Host(link) = &self.link {
                                link.send_to(peer, &SessionMessage::Command(cmd), prefix);
                            }
                        }
                    }
                },
                TransportMode::Client => {
                    // Everything routes through the host, which forwards
                    // All and Single on our behalf.
                    let needs_send = match scope {
                        DispatchScope::All | DispatchScope::Server => true,
                        DispatchScope::Single(peer) => peer != self.local_peer,
                    };
                    if needs_send {
                        if let ActiveLink::Client(link) = &self.link {
                            link.send(&SessionMessage::Command(cmd), prefix);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Loads a scene. Locally when `Idle`; when hosting, advances the scene
    /// prefix and issues a buffered scene load so current and future peers
    /// follow. A client never moves scenes on its own.
    pub fn load_scene(&mut self, scene_name: &str) -> Result<u32, DirectorError> {
        let mode = self.session.mode();
        match mode {
            TransportMode::Connecting | TransportMode::Client => {
                Err(DirectorError::ModeViolation {
                    operation: "load_scene",
                    mode,
                })
            }
            TransportMode::Idle => {
                let prefix = self.session.advance_scene();
                self.emit(DirectorEvent::SceneLoaded {
                    scene_name: scene_name.to_string(),
                    scene_prefix: prefix,
                });
                Ok(prefix)
            }
            TransportMode::Hosting => {
                let prefix = self.session.advance_scene();
                let msg = SessionMessage::SceneLoad(SceneLoadMessage {
                    scene_name: scene_name.to_string(),
                    scene_prefix: prefix,
                });
                self.buffered.push((msg.clone(), prefix));
                if let ActiveLink::Host(link) = &self.link {
                    link.set_scene_prefix(prefix);
                    link.broadcast(&msg, prefix);
                }
                info!("scene {scene_name:?} loaded under prefix {prefix}");
                self.emit(DirectorEvent::SceneLoaded {
                    scene_name: scene_name.to_string(),
                    scene_prefix: prefix,
                });
                Ok(prefix)
            }
        }
    }

    /// Kicks a connected peer (host only). The roster layers banning on
    /// top of this.
    pub fn kick_peer(&mut self, peer: PeerId) -> bool {
        if self.session.mode() != TransportMode::Hosting {
            return false;
        }
        if let ActiveLink::Host(link) = &self.link {
            link.disconnect_peer(peer, LeaveReason::Kicked);
            true
        } else {
            false
        }
    }

    // ── Tick ──────────────────────────────────────────────────────────────────

    /// Drains marshaled link completions and drives time-based work
    /// (keepalive pings, silence reaping). Call from the owned scheduler
    /// loop; all state mutation happens here.
    pub fn tick(&mut self, now: Instant) {
        while let Ok(event) = self.link_rx.try_recv() {
            self.handle_link_event(event, now);
        }
        self.drive_keepalive(now);
    }

    fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::HostBound { port } => {
                if self.session.mode() != TransportMode::Connecting {
                    debug!("late HostBound ignored");
                    return;
                }
                let Some(params) = self.pending_host.take() else {
                    return;
                };
                self.session.establish_host(params.dedicated, params.scope);
                self.local_peer = HOST_PEER_ID;
                // Scene loads from an earlier offline phase carry over; the
                // link stamps the fence into every handshake ack.
                if let ActiveLink::Host(link) = &self.link {
                    link.set_scene_prefix(self.session.scene_prefix());
                }
                info!("session {:?} is up on port {port}", params.session_name);
                self.emit(DirectorEvent::HostStarted { port });
            }
            LinkEvent::HostBindFailed { error } => {
                if self.session.mode() != TransportMode::Connecting {
                    return;
                }
                warn!("host bind failed: {error}");
                let reason = match error.kind() {
                    io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied => {
                        ConnectError::Refused
                    }
                    _ => ConnectError::Unknown,
                };
                let detail = error.to_string();
                self.reset_after_failure();
                self.emit(DirectorEvent::HostFailed { reason, detail });
            }
            LinkEvent::PeerJoined { peer, addr } => {
                if self.session.mode() != TransportMode::Hosting {
                    return;
                }
                self.peers.insert(
                    peer,
                    PeerState {
                        addr,
                        last_seen: now,
                        outstanding_ping: None,
                        rtt: None,
                    },
                );
                // Replay the buffered history, then activate. Both happen
                // here on the tick thread, so no broadcast can slip in
                // between: replayed frames always precede post-join traffic
                // on the peer's stream.
                if let ActiveLink::Host(link) = &self.link {
                    for (msg, prefix) in &self.buffered {
                        link.send_to(peer, msg, *prefix);
                    }
                    link.activate_peer(peer);
                }
                self.emit(DirectorEvent::PeerJoined { peer, addr });
            }
            LinkEvent::PeerLeft { peer, reason } => {
                if self.peers.remove(&peer).is_some() {
                    self.emit(DirectorEvent::PeerLeft { peer, reason });
                }
            }
            LinkEvent::ConnectSucceeded {
                assigned_peer,
                scene_prefix,
            } => {
                if self.session.mode() != TransportMode::Connecting {
                    return;
                }
                self.local_peer = assigned_peer;
                self.session.establish_client();
                self.session.adopt_scene_prefix(scene_prefix);
                self.host_last_seen = now;
                self.emit(DirectorEvent::Connected { assigned_peer });
            }
            LinkEvent::ConnectFailed { reason } => {
                if self.session.mode() != TransportMode::Connecting {
                    return;
                }
                self.reset_after_failure();
                self.emit(DirectorEvent::ConnectFailed { reason });
            }
            LinkEvent::Frame { from, frame } => self.handle_frame(from, frame, now),
            LinkEvent::LinkDown { reason } => {
                // Ignored unless we still think we are connected – a local
                // disconnect or join rejection already reset the session.
                if self.session.mode() == TransportMode::Client {
                    self.link = ActiveLink::None;
                    self.teardown(reason);
                }
            }
        }
    }

    fn handle_frame(&mut self, from: PeerId, frame: netplay_core::Frame, now: Instant) {
        let mode = self.session.mode();
        if !mode.is_networked() {
            debug!("frame ignored in mode {mode}");
            return;
        }

        if let Some(peer) = self.peers.get_mut(&from) {
            peer.last_seen = now;
        }
        if mode == TransportMode::Client {
            self.host_last_seen = now;
        }

        // Scene fence. Only scene-scoped traffic is fenced: entity frames,
        // entity-targeted commands, and scene loads themselves. Session-
        // scoped commands (the roster lives there) are valid across scene
        // changes – a late joiner must replay roster history recorded under
        // earlier prefixes.
        let scene_scoped = match &frame.message {
            SessionMessage::EntitySpawn(_)
            | SessionMessage::EntityDestroy(_)
            | SessionMessage::SceneLoad(_) => true,
            SessionMessage::Command(cmd) => {
                matches!(cmd.target, DispatchTarget::Entity(_))
            }
            _ => false,
        };
        if scene_scoped && frame.scene_prefix < self.session.scene_prefix() {
            debug!(
                "dropping stale frame (prefix {} < {})",
                frame.scene_prefix,
                self.session.scene_prefix()
            );
            return;
        }

        match frame.message {
            SessionMessage::Command(cmd) => {
                self.handle_remote_command(from, cmd, frame.scene_prefix)
            }
            SessionMessage::EntitySpawn(spawn) => {
                self.entities.insert(
                    spawn.entity,
                    EntityRecord {
                        id: spawn.entity,
                        descriptor: spawn.descriptor.clone(),
                        group: spawn.group,
                    },
                );
                if mode == TransportMode::Hosting {
                    self.buffered
                        .push((SessionMessage::EntitySpawn(spawn.clone()), frame.scene_prefix));
                    if let ActiveLink::Host(link) = &self.link {
                        link.broadcast_except(
                            Some(from),
                            &SessionMessage::EntitySpawn(spawn),
                            frame.scene_prefix,
                        );
                    }
                }
            }
            SessionMessage::EntityDestroy(destroy) => {
                self.entities.remove(&destroy.entity);
                if mode == TransportMode::Hosting {
                    self.buffered.retain(|(buffered, _)| {
                        !matches!(buffered, SessionMessage::EntitySpawn(s) if s.entity == destroy.entity)
                    });
                    if let ActiveLink::Host(link) = &self.link {
                        link.broadcast_except(
                            Some(from),
                            &SessionMessage::EntityDestroy(destroy),
                            frame.scene_prefix,
                        );
                    }
                }
            }
            SessionMessage::SceneLoad(load) => {
                if mode == TransportMode::Client {
                    self.session.adopt_scene_prefix(load.scene_prefix);
                    self.emit(DirectorEvent::SceneLoaded {
                        scene_name: load.scene_name,
                        scene_prefix: load.scene_prefix,
                    });
                } else {
                    warn!("ignoring scene load from peer {from}; only the host moves scenes");
                }
            }
            SessionMessage::Ping(_) => {
                // Liveness signal; the link already answered with a Pong.
            }
            SessionMessage::Pong(token) => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    if let Some((expected, sent_at)) = peer.outstanding_ping {
                        if expected == token {
                            peer.rtt = Some(now.duration_since(sent_at));
                            peer.outstanding_ping = None;
                        }
                    }
                }
            }
            SessionMessage::Hello(_) | SessionMessage::HelloAck(_) => {
                warn!("unexpected handshake frame from peer {from}")
            }
            SessionMessage::Disconnect { .. } => {
                // Consumed by the link layer; nothing to do here.
            }
        }
    }

    fn handle_remote_command(&mut self, from: PeerId, cmd: CommandMessage, prefix: u32) {
        let mode = self.session.mode();

        // The host forwards on the sender's behalf before executing, so
        // forwarding is never gated on whether a local handler exists.
        if mode == TransportMode::Hosting {
            match cmd.scope {
                DispatchScope::All => {
                    if cmd.durability == Durability::Buffered {
                        self.buffered
                            .push((SessionMessage::Command(cmd.clone()), prefix));
                    }
                    if let ActiveLink::Host(link) = &self.link {
                        link.broadcast_except(
                            Some(from),
                            &SessionMessage::Command(cmd.clone()),
                            prefix,
                        );
                    }
                }
                DispatchScope::Single(peer) if peer != self.local_peer => {
                    if let ActiveLink::Host(link) = &self.link {
                        link.send_to(peer, &SessionMessage::Command(cmd.clone()), prefix);
                    }
                }
                _ => {}
            }
        }

        let execute = match cmd.scope {
            DispatchScope::All => true,
            DispatchScope::Server => mode == TransportMode::Hosting,
            DispatchScope::Single(peer) => peer == self.local_peer,
        };
        if execute {
            let origin = DispatchOrigin {
                sender: cmd.sender,
                remote_addr: self.peers.get(&from).map(|p| p.addr),
                target: cmd.target,
                is_local: false,
            };
            let mut outbox = Outbox::new();
            self.registry
                .invoke_remote(&cmd.name, &origin, &cmd.args, &mut outbox);
            self.flush_outbox(outbox);
        }
    }

    fn flush_outbox(&mut self, mut outbox: Outbox) {
        for queued in outbox.take_dispatches() {
            if let Err(e) = self.dispatch(
                queued.target,
                &queued.name,
                queued.args,
                queued.durability,
                queued.scope,
            ) {
                warn!("queued dispatch {:?} failed: {e}", queued.name);
            }
        }
        if let Some(reason) = outbox.take_disconnect() {
            self.emit(DirectorEvent::JoinRejected { reason });
            if self.session.mode().is_networked() {
                self.teardown(LeaveReason::UserInitiated);
            }
        }
    }

    fn drive_keepalive(&mut self, now: Instant) {
        match self.session.mode() {
            TransportMode::Hosting => {
                if now.duration_since(self.last_ping_round) >= self.config.ping_interval {
                    self.last_ping_round = now;
                    if let ActiveLink::Host(link) = &self.link {
                        for (peer, state) in self.peers.iter_mut() {
                            self.next_ping_token += 1;
                            let token = self.next_ping_token;
                            if state.outstanding_ping.is_none() {
                                state.outstanding_ping = Some((token, now));
                            }
                            link.send_to(*peer, &SessionMessage::Ping(token), 0);
                        }
                    }
                }

                let silence = self.config.ping_timeout;
                let dead: Vec<PeerId> = self
                    .peers
                    .iter()
                    .filter(|(_, state)| now.duration_since(state.last_seen) > silence)
                    .map(|(peer, _)| *peer)
                    .collect();
                for peer in dead {
                    info!("peer {peer} silent for {silence:?}; dropping");
                    if let ActiveLink::Host(link) = &self.link {
                        // The PeerLeft completion arrives through the channel.
                        link.disconnect_peer(peer, LeaveReason::Timeout);
                    }
                }
            }
            TransportMode::Client => {
                if now.duration_since(self.host_last_seen) > self.config.ping_timeout {
                    warn!("host silent for {:?}; dropping the session", self.config.ping_timeout);
                    if let ActiveLink::Client(link) = &self.link {
                        link.shutdown();
                    }
                    self.link = ActiveLink::None;
                    self.teardown(LeaveReason::Timeout);
                }
            }
            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    fn teardown(&mut self, reason: LeaveReason) {
        match std::mem::replace(&mut self.link, ActiveLink::None) {
            ActiveLink::Host(link) => {
                let goodbye = if reason == LeaveReason::UserInitiated {
                    LeaveReason::HostShutdown
                } else {
                    reason
                };
                link.shutdown(goodbye);
            }
            ActiveLink::Client(link) => {
                link.send(&SessionMessage::Disconnect { reason }, 0);
                link.shutdown();
            }
            ActiveLink::None => {}
        }
        self.pending_host = None;
        self.peers.clear();
        self.buffered.clear();
        // Entity lifetime beyond the session belongs to the gameplay layer;
        // the transport's table is session state.
        self.entities.clear();
        self.local_peer = HOST_PEER_ID;
        self.session.reset();
        self.emit(DirectorEvent::Disconnected { reason });
    }

    fn reset_after_failure(&mut self) {
        self.link = ActiveLink::None;
        self.pending_host = None;
        self.session.reset();
    }

    fn emit(&self, event: DirectorEvent) {
        let _ = self.events.send(event);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
