//! The process context: one explicitly constructed object owning the
//! director, discovery service, directory client, and roster for the
//! process lifetime.
//!
//! Nothing here is a static. `main` (or a test) builds a [`NodeContext`],
//! drives [`NodeContext::tick`] from an owned scheduler loop, and calls
//! [`NodeContext::shutdown`] on the way out. Consumers receive the context
//! by reference.
//!
//! The context also owns the cross-component composition around session
//! transitions: a successful non-private host registers with the directory
//! and starts announcing on the LAN; a disconnect withdraws and stops
//! announcing; roster lifecycle hooks run off director events.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::warn;

use netplay_core::{DiscoveredGame, HostScope, PlayerId, TransportMode};

use crate::application::commands::CommandRegistry;
use crate::application::director::{
    DirectorError, DirectorEvent, HostParams, TransportDirector,
};
use crate::application::roster::RosterServer;
use crate::infrastructure::config::NodeConfig;
use crate::infrastructure::directory::{
    DirectoryClient, DirectoryError, SessionListing, TcpRegistryTransport,
};
use crate::infrastructure::discovery::{
    DiscoveryDecision, DiscoveryError, DiscoveryPhase, DiscoveryService,
};

/// Everything a single tick surfaced to the caller.
#[derive(Debug)]
pub enum TickEvent {
    Director(DirectorEvent),
    Discovery(DiscoveryDecision),
}

struct HostingInfo {
    params: HostParams,
    bound_port: Option<u16>,
}

pub struct NodeContext {
    config: NodeConfig,
    director: TransportDirector,
    director_events: mpsc::UnboundedReceiver<DirectorEvent>,
    discovery: DiscoveryService,
    directory: Arc<DirectoryClient>,
    roster: RosterServer,
    active_host: Option<HostingInfo>,
    published: bool,
    last_published_count: usize,
}

impl NodeContext {
    /// Builds the full component graph from a config. Performs no I/O; the
    /// sockets come up when a session or a search starts.
    pub fn new(config: NodeConfig) -> Self {
        let mut registry = CommandRegistry::new();
        let roster = RosterServer::new(&config.node.game_version, &config.node.display_name);
        roster
            .install(&mut registry)
            .expect("roster commands cannot collide in a fresh registry");

        let (director, director_events) =
            TransportDirector::new(config.director_config(), registry);
        let discovery = DiscoveryService::new(config.discovery_config());

        let registry_addr = config
            .directory
            .registry_addr
            .parse()
            .unwrap_or_else(|_| {
                warn!(
                    "invalid registry address {:?}; falling back to the default",
                    config.directory.registry_addr
                );
                "127.0.0.1:23466".parse().unwrap()
            });
        let directory = Arc::new(DirectoryClient::new(
            &config.directory.session_type_name,
            Arc::new(TcpRegistryTransport::new(registry_addr)),
        ));

        Self {
            config,
            director,
            director_events,
            discovery,
            directory,
            roster,
            active_host: None,
            published: false,
            last_published_count: 0,
        }
    }

    // ── Component access ──────────────────────────────────────────────────────

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn director(&self) -> &TransportDirector {
        &self.director
    }

    pub fn director_mut(&mut self) -> &mut TransportDirector {
        &mut self.director
    }

    pub fn roster(&self) -> &RosterServer {
        &self.roster
    }

    pub fn directory(&self) -> &Arc<DirectoryClient> {
        &self.directory
    }

    pub fn discovery_mut(&mut self) -> &mut DiscoveryService {
        &mut self.discovery
    }

    // ── Session operations ────────────────────────────────────────────────────

    /// Hosts a session; the listing for the directory is derived from these
    /// parameters once the bind succeeds.
    pub fn host_session(&mut self, params: HostParams) -> Result<(), DirectorError> {
        self.director.host_session(params.clone())?;
        self.active_host = Some(HostingInfo {
            params,
            bound_port: None,
        });
        Ok(())
    }

    pub fn connect_to_session(
        &mut self,
        address: IpAddr,
        port: u16,
        password: &str,
    ) -> Result<(), DirectorError> {
        self.director.connect_to_session(address, port, password)
    }

    pub fn disconnect(&mut self) -> Result<(), DirectorError> {
        self.director.disconnect()
        // Directory withdrawal and roster cleanup run off the Disconnected
        // event on the next tick.
    }

    /// Starts a LAN search (election protocol). The decision arrives as a
    /// [`TickEvent::Discovery`].
    pub fn begin_discovery(&mut self, now: Instant) -> Result<(), DiscoveryError> {
        self.discovery.begin_search(now)
    }

    /// Kicks a player; with `ban`, its address is refused for the rest of
    /// the session.
    pub fn kick(&mut self, player: PlayerId, ban: bool) -> bool {
        self.roster.kick(&mut self.director, player, ban)
    }

    // ── Browsing ──────────────────────────────────────────────────────────────

    /// Live LAN results.
    pub fn lan_games(&self, now: Instant) -> Vec<DiscoveredGame> {
        self.discovery.found_games(now)
    }

    /// Queries the wide-area directory.
    pub async fn wan_games(&self) -> Result<Vec<DiscoveredGame>, DirectoryError> {
        self.directory.query().await
    }

    // ── Tick ──────────────────────────────────────────────────────────────────

    /// One scheduler step: drives discovery and the director, runs the
    /// roster/directory reactions, and returns everything that happened for
    /// the caller to act on.
    pub fn tick(&mut self, now: Instant) -> Vec<TickEvent> {
        let mut out = Vec::new();

        if let Some(decision) = self.discovery.tick(now) {
            out.push(TickEvent::Discovery(decision));
        }

        self.director.tick(now);
        while let Ok(event) = self.director_events.try_recv() {
            self.react(&event, now);
            out.push(TickEvent::Director(event));
        }

        self.refresh_listing_if_needed();
        out
    }

    /// Tears the session down (if any) and stops discovery. Call once on
    /// the way out of the scheduler loop.
    pub fn shutdown(&mut self) {
        if self.director.mode() != TransportMode::Idle {
            let _ = self.director.disconnect();
        }
        while let Ok(event) = self.director_events.try_recv() {
            self.react(&event, Instant::now());
        }
        self.discovery.stop();
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn react(&mut self, event: &DirectorEvent, now: Instant) {
        match event {
            DirectorEvent::HostStarted { port } => {
                self.roster.on_session_started(&mut self.director);
                if let Some(info) = &mut self.active_host {
                    info.bound_port = Some(*port);
                }
                if self.director.host_scope() != HostScope::Private {
                    if let Err(e) = self.discovery.begin_announce(now) {
                        warn!("LAN announce failed: {e}");
                    }
                    self.publish_listing();
                }
            }
            DirectorEvent::Connected { .. } => {
                // Joined a session; any running search is over.
                self.discovery.stop();
                self.roster.on_connected(&mut self.director);
            }
            DirectorEvent::PeerLeft { peer, .. } => {
                self.roster.on_peer_left(&mut self.director, *peer);
            }
            DirectorEvent::Disconnected { .. }
            | DirectorEvent::ConnectFailed { .. }
            | DirectorEvent::HostFailed { .. } => {
                if self.active_host.take().is_some() {
                    if self.published {
                        self.directory.withdraw_background();
                        self.published = false;
                    }
                    if self.discovery.phase() == DiscoveryPhase::Announcing {
                        self.discovery.stop();
                    }
                }
                self.roster.on_session_ended();
            }
            _ => {}
        }
    }

    fn publish_listing(&mut self) {
        let Some(info) = &self.active_host else { return };
        let Some(port) = info.bound_port else { return };
        let count = self.roster.player_count();
        let listing = SessionListing {
            session_name: info.params.session_name.clone(),
            comment: String::new(),
            dedicated: info.params.dedicated,
            public: info.params.scope == HostScope::Public,
            port,
            player_count: count as u32,
            max_player_count: info.params.max_peers as u32,
        };
        self.directory.publish_background(listing);
        self.published = true;
        self.last_published_count = count;
    }

    /// Re-publishes when the player count moved, keeping the directory
    /// entry current.
    fn refresh_listing_if_needed(&mut self) {
        if !self.published {
            return;
        }
        if self.roster.player_count() != self.last_published_count {
            self.publish_listing();
        }
    }
}

/// Merges WAN and LAN result lists into one snapshot, preferring the LAN
/// entry when both name the same endpoint. Kept as a helper because the
/// two sources are deliberately independent – no component merges them
/// implicitly.
pub fn merge_games(lan: Vec<DiscoveredGame>, wan: Vec<DiscoveredGame>) -> Vec<DiscoveredGame> {
    let mut merged = lan;
    for game in wan {
        if !merged.iter().any(|g| g.address == game.address) {
            merged.push(game);
        }
    }
    merged
}

// ── Tests ─────────────────────────────────────────────────────────────────────
