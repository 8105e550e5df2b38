//! UDP broadcast peer discovery and leader election.
//!
//! Peers on the same local network converge on one host without any
//! coordinator. Two literal ASCII tokens are broadcast on a fixed port:
//! `CANDIDATE` ("I would host", default `wanttobeaserver`) and `READY`
//! ("I am hosting", default `iamaserver`). The sender's address is taken
//! from the datagram's source endpoint, never from the payload.
//!
//! A searching peer rebroadcasts CANDIDATE every `announce_interval` and
//! records every broadcast it receives as an [`Announcement`] (expired
//! after `ttl`). Any READY ends the search immediately with a join
//! decision. Otherwise, once `search_window` elapses, every address seen –
//! including the local one – is scored with [`election_score`]; the maximum
//! wins. A winning local peer moves to `Announcing` and emits READY from
//! then on; a losing peer clears its announcements and restarts the window,
//! waiting for the winner's READY.
//!
//! This is a best-effort, eventually convergent heuristic over an
//! unreliable broadcast channel – not consensus. Concurrent election
//! windows with asymmetric views of the peer set can transiently elect two
//! hosts; the session handshake sorts the survivors out. Do not mistake
//! this for a Raft-grade protocol.
//!
//! Socket receives run on a dedicated thread with a short read timeout
//! (checking a running flag between reads) and are marshaled onto the tick
//! thread over a channel. `stop()` closes the socket and is idempotent;
//! completions that arrive afterwards are discarded because a stopped
//! service ignores its drain path entirely.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use netplay_core::DiscoveredGame;

/// Error type for discovery socket operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Socket configuration or thread spawn failed.
    #[error("discovery socket error: {0}")]
    Socket(#[from] io::Error),
}

/// Configuration for the discovery protocol.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port the protocol runs on.
    pub port: u16,
    /// Destination for broadcasts. The limited broadcast address in
    /// production; tests point it at loopback.
    pub broadcast_addr: Ipv4Addr,
    pub candidate_token: String,
    pub ready_token: String,
    /// Rebroadcast cadence while searching or announcing.
    pub announce_interval: Duration,
    /// How long a search collects candidates before electing.
    pub search_window: Duration,
    /// Announcements older than this are expired.
    pub ttl: Duration,
    /// Session transport port a READY peer is assumed to host on.
    pub session_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 22043,
            broadcast_addr: Ipv4Addr::BROADCAST,
            candidate_token: "wanttobeaserver".to_string(),
            ready_token: "iamaserver".to_string(),
            announce_interval: Duration::from_secs(1),
            search_window: Duration::from_secs(3),
            ttl: Duration::from_secs(5),
            session_port: 21182,
        }
    }
}

/// What the service is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Idle,
    Searching,
    Announcing,
}

/// Instruction to the caller when a search concludes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryDecision {
    /// A host is already up; connect to it.
    Join(SocketAddr),
    /// The election chose us; begin hosting (the service is now
    /// announcing).
    Host,
}

/// A timestamped record of a broadcast from another peer.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub source: Ipv4Addr,
    pub received_at: Instant,
    pub is_ready: bool,
}

/// Deterministic total ordering over candidate addresses.
///
/// The numeric value of the 32-bit IPv4 address: total and collision-free,
/// unlike deriving a key from the address's decimal digits (which aliases
/// e.g. 1.23.4.5 and 12.3.4.5). Non-IPv4 sources never enter the election;
/// the broadcast channel is IPv4-only here.
pub fn election_score(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

pub struct DiscoveryService {
    config: DiscoveryConfig,
    phase: DiscoveryPhase,
    /// Send side; the receive thread owns a clone.
    socket: Option<UdpSocket>,
    running: Arc<AtomicBool>,
    rx: Option<mpsc::Receiver<(SocketAddr, Vec<u8>)>>,
    announcements: HashMap<Ipv4Addr, Announcement>,
    window_started: Instant,
    last_broadcast: Option<Instant>,
    local_addr: Ipv4Addr,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            phase: DiscoveryPhase::Idle,
            socket: None,
            running: Arc::new(AtomicBool::new(false)),
            rx: None,
            announcements: HashMap::new(),
            window_started: Instant::now(),
            last_broadcast: None,
            local_addr: Ipv4Addr::LOCALHOST,
        }
    }

    pub fn phase(&self) -> DiscoveryPhase {
        self.phase
    }

    /// The port the socket actually bound (differs from the configured one
    /// when that was 0).
    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Enters `Searching`: rebroadcast CANDIDATE, collect announcements,
    /// elect after the window. Restarts cleanly when already active.
    pub fn begin_search(&mut self, now: Instant) -> Result<(), DiscoveryError> {
        self.stop();
        self.open_socket()?;
        self.phase = DiscoveryPhase::Searching;
        self.window_started = now;
        self.last_broadcast = None;
        self.announcements.clear();
        info!("discovery search started on UDP {}", self.config.port);
        Ok(())
    }

    /// Enters `Announcing` directly, bypassing the election. Used by a peer
    /// that already decided to host.
    pub fn begin_announce(&mut self, _now: Instant) -> Result<(), DiscoveryError> {
        self.stop();
        self.open_socket()?;
        self.phase = DiscoveryPhase::Announcing;
        self.last_broadcast = None;
        info!("announcing as host on UDP {}", self.config.port);
        Ok(())
    }

    /// Stops the service. Idempotent: stopping an already stopped service
    /// does nothing and does not error. The announcement set survives so
    /// [`found_games`] keeps serving recent results until they expire.
    ///
    /// [`found_games`]: DiscoveryService::found_games
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.socket = None;
        self.rx = None;
        self.phase = DiscoveryPhase::Idle;
        self.last_broadcast = None;
    }

    /// Drives broadcasting, TTL expiry, and election deadlines off the
    /// caller's clock. Returns a decision when a search concludes.
    pub fn tick(&mut self, now: Instant) -> Option<DiscoveryDecision> {
        // Stopped-state guard: a completion that raced `stop()` must not
        // mutate a stopped service.
        if self.phase == DiscoveryPhase::Idle {
            return None;
        }

        self.drain_datagrams(now);
        self.expire(now);

        match self.phase {
            DiscoveryPhase::Searching => {
                // Any READY ends the search immediately.
                let ready = self
                    .announcements
                    .values()
                    .filter(|a| a.is_ready)
                    .max_by_key(|a| election_score(a.source))
                    .map(|a| a.source);
                if let Some(ip) = ready {
                    let addr = SocketAddr::new(IpAddr::V4(ip), self.config.session_port);
                    info!("found a ready host at {addr}");
                    self.stop();
                    return Some(DiscoveryDecision::Join(addr));
                }

                if self.broadcast_due(now) {
                    self.send_token(true);
                }

                if now.duration_since(self.window_started) >= self.config.search_window {
                    return self.close_window(now);
                }
                None
            }
            DiscoveryPhase::Announcing => {
                if self.broadcast_due(now) {
                    self.send_token(false);
                }
                None
            }
            DiscoveryPhase::Idle => None,
        }
    }

    /// The live set of READY announcements as joinable games.
    pub fn found_games(&self, now: Instant) -> Vec<DiscoveredGame> {
        self.announcements
            .values()
            .filter(|a| a.is_ready && now.duration_since(a.received_at) < self.config.ttl)
            .map(|a| {
                DiscoveredGame::from_lan_announcement(SocketAddr::new(
                    IpAddr::V4(a.source),
                    self.config.session_port,
                ))
            })
            .collect()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn open_socket(&mut self) -> Result<(), DiscoveryError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|source| DiscoveryError::BindFailed {
                addr: bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;

        self.local_addr = local_ipv4();

        // Fresh flag per run: an old receive thread winding down cannot be
        // revived by a new start.
        let running = Arc::new(AtomicBool::new(true));
        self.running = Arc::clone(&running);

        let reader = socket.try_clone()?;
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("netplay-discovery".to_string())
            .spawn(move || receive_loop(reader, tx, running))?;

        self.socket = Some(socket);
        self.rx = Some(rx);
        Ok(())
    }

    fn drain_datagrams(&mut self, now: Instant) {
        let Some(rx) = &self.rx else { return };

        let mut received = Vec::new();
        while let Ok(datagram) = rx.try_recv() {
            received.push(datagram);
        }

        for (src, payload) in received {
            let is_ready = payload.as_slice() == self.config.ready_token.as_bytes();
            let is_candidate = payload.as_slice() == self.config.candidate_token.as_bytes();
            if !is_ready && !is_candidate {
                debug!("ignoring unknown discovery payload from {src}");
                continue;
            }
            let IpAddr::V4(ip) = src.ip() else {
                warn!("ignoring non-IPv4 discovery source {src}");
                continue;
            };
            self.record(ip, is_ready, now);
        }
    }

    fn record(&mut self, source: Ipv4Addr, is_ready: bool, now: Instant) {
        self.announcements.insert(
            source,
            Announcement {
                source,
                received_at: now,
                is_ready,
            },
        );
    }

    fn expire(&mut self, now: Instant) {
        let ttl = self.config.ttl;
        self.announcements
            .retain(|_, a| now.duration_since(a.received_at) < ttl);
    }

    fn close_window(&mut self, now: Instant) -> Option<DiscoveryDecision> {
        let mut best = self.local_addr;
        let mut best_score = election_score(self.local_addr);
        for announcement in self.announcements.values() {
            let score = election_score(announcement.source);
            if score > best_score {
                best_score = score;
                best = announcement.source;
            }
        }

        if best == self.local_addr {
            info!("elected as host ({} scored {best_score})", self.local_addr);
            self.phase = DiscoveryPhase::Announcing;
            self.last_broadcast = None;
            return Some(DiscoveryDecision::Host);
        }

        debug!("peer {best} outscores {}; waiting for its READY", self.local_addr);
        self.announcements.clear();
        self.window_started = now;
        None
    }

    fn broadcast_due(&mut self, now: Instant) -> bool {
        match self.last_broadcast {
            Some(at) if now.duration_since(at) < self.config.announce_interval => false,
            _ => {
                self.last_broadcast = Some(now);
                true
            }
        }
    }

    fn send_token(&self, candidate: bool) {
        let Some(socket) = &self.socket else { return };
        let token = if candidate {
            &self.config.candidate_token
        } else {
            &self.config.ready_token
        };
        let dest = SocketAddr::new(IpAddr::V4(self.config.broadcast_addr), self.config.port);
        if let Err(e) = socket.send_to(token.as_bytes(), dest) {
            warn!("discovery broadcast to {dest} failed: {e}");
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn receive_loop(
    socket: UdpSocket,
    tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 512];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                if tx.send((src, buf[..len].to_vec())).is_err() {
                    // Receiver dropped: the service stopped.
                    break;
                }
            }
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    debug!("discovery recv error: {e}");
                }
                continue;
            }
        }
    }
    debug!("discovery receive thread stopped");
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Best-effort local IPv4 address. Connecting a UDP socket sends no traffic
/// but makes the OS resolve the source address it would route with.
fn local_ipv4() -> Ipv4Addr {
    let probe = || -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
        socket.connect(("8.8.8.8", 53)).ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    };
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_searching(local: &str, base: Instant) -> DiscoveryService {
        // No socket: drain and broadcast are no-ops, which is exactly what
        // election and TTL logic tests need.
        let mut service = DiscoveryService::new(DiscoveryConfig::default());
        service.phase = DiscoveryPhase::Searching;
        service.window_started = base;
        service.local_addr = local.parse().unwrap();
        service
    }

    #[test]
    fn test_election_score_is_collision_free_where_digit_keys_alias() {
        // The digit-concatenation key of the original design maps both of
        // these to 12345.
        let a: Ipv4Addr = "1.23.4.5".parse().unwrap();
        let b: Ipv4Addr = "12.3.4.5".parse().unwrap();
        assert_ne!(election_score(a), election_score(b));
    }

    #[test]
    fn test_election_score_orders_numerically() {
        let low: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let high: Ipv4Addr = "10.0.0.9".parse().unwrap();
        assert!(election_score(high) > election_score(low));
    }

    #[test]
    fn test_stop_twice_is_idempotent() {
        let mut service = DiscoveryService::new(DiscoveryConfig::default());
        service.stop();
        assert_eq!(service.phase(), DiscoveryPhase::Idle);
        service.stop();
        assert_eq!(service.phase(), DiscoveryPhase::Idle);
    }

    #[test]
    fn test_tick_after_stop_mutates_nothing() {
        let base = Instant::now();
        let mut service = offline_searching("10.0.0.1", base);
        service.record("10.0.0.5".parse().unwrap(), true, base);
        service.stop();

        let decision = service.tick(base + Duration::from_secs(60));
        assert_eq!(decision, None);
        // The stale READY would have produced a Join had the guard failed.
    }

    #[test]
    fn test_ready_announcement_ends_search_immediately() {
        let base = Instant::now();
        let mut service = offline_searching("10.0.0.1", base);
        service.record("10.0.0.7".parse().unwrap(), true, base);

        // Well before the window closes.
        let decision = service.tick(base + Duration::from_millis(10));
        let expected: SocketAddr = "10.0.0.7:21182".parse().unwrap();
        assert_eq!(decision, Some(DiscoveryDecision::Join(expected)));
        assert_eq!(service.phase(), DiscoveryPhase::Idle);
    }

    #[test]
    fn test_expired_announcement_is_absent_from_election() {
        let base = Instant::now();
        let mut service = offline_searching("10.0.0.1", base);
        let ttl = service.config.ttl;

        // Recorded at the start, ticked at window close: the higher-scored
        // candidate is ttl + 1s old by then and must not win.
        service.record("10.0.0.200".parse().unwrap(), false, base);
        let at = base + ttl + Duration::from_secs(1);
        service.window_started = at - service.config.search_window;

        let decision = service.tick(at);
        assert_eq!(
            decision,
            Some(DiscoveryDecision::Host),
            "only the local address survives expiry, so the local peer wins"
        );
    }

    #[test]
    fn test_election_elects_exactly_one_peer_across_full_views() {
        let base = Instant::now();
        let peers = ["10.0.0.3", "10.0.0.14", "10.0.0.200", "10.0.0.7"];

        let mut winners = 0;
        for me in peers {
            let mut service = offline_searching(me, base);
            for other in peers {
                if other != me {
                    service.record(other.parse().unwrap(), false, base);
                }
            }
            let decision = service.tick(base + service.config.search_window);
            if decision == Some(DiscoveryDecision::Host) {
                winners += 1;
                assert_eq!(me, "10.0.0.200", "the max-scoring peer must win");
            }
        }
        assert_eq!(winners, 1, "exactly one peer may elect itself");
    }

    #[test]
    fn test_losing_peer_clears_announcements_and_restarts_window() {
        let base = Instant::now();
        let mut service = offline_searching("10.0.0.1", base);
        service.record("10.0.0.9".parse().unwrap(), false, base);

        let at = base + service.config.search_window;
        let decision = service.tick(at);

        assert_eq!(decision, None);
        assert_eq!(service.phase(), DiscoveryPhase::Searching);
        assert!(service.announcements.is_empty(), "set cleared for the retry");
        assert_eq!(service.window_started, at, "window restarted");
    }

    #[test]
    fn test_two_peer_scenario_higher_announces_lower_joins() {
        let base = Instant::now();
        let mut high = offline_searching("10.0.0.9", base);
        let mut low = offline_searching("10.0.0.1", base);

        // Both saw each other's CANDIDATE during the window.
        high.record("10.0.0.1".parse().unwrap(), false, base);
        low.record("10.0.0.9".parse().unwrap(), false, base);

        let at = base + high.config.search_window;
        assert_eq!(high.tick(at), Some(DiscoveryDecision::Host));
        assert_eq!(high.phase(), DiscoveryPhase::Announcing);

        assert_eq!(low.tick(at), None);
        assert_eq!(low.phase(), DiscoveryPhase::Searching);

        // The winner's READY arrives; the loser joins.
        low.record("10.0.0.9".parse().unwrap(), true, at + Duration::from_millis(100));
        let decision = low.tick(at + Duration::from_millis(150));
        let expected: SocketAddr = "10.0.0.9:21182".parse().unwrap();
        assert_eq!(decision, Some(DiscoveryDecision::Join(expected)));
    }

    #[test]
    fn test_found_games_lists_only_live_ready_announcements() {
        let base = Instant::now();
        let mut service = offline_searching("10.0.0.1", base);
        service.record("10.0.0.7".parse().unwrap(), true, base);
        service.record("10.0.0.8".parse().unwrap(), false, base);

        let games = service.found_games(base + Duration::from_millis(100));
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].address, "10.0.0.7:21182".parse().unwrap());
        assert!(games[0].is_on_lan);

        // Past the TTL nothing is listed.
        let games = service.found_games(base + service.config.ttl + Duration::from_secs(1));
        assert!(games.is_empty());
    }

    #[test]
    fn test_candidate_then_ready_upgrades_announcement() {
        let base = Instant::now();
        let mut service = offline_searching("10.0.0.1", base);
        service.record("10.0.0.7".parse().unwrap(), false, base);
        service.record("10.0.0.7".parse().unwrap(), true, base + Duration::from_millis(50));

        assert_eq!(service.announcements.len(), 1);
        assert!(service.announcements.values().next().unwrap().is_ready);
    }
}
