//! The TCP session link: host accept loop and client connection.
//!
//! The link owns all socket I/O for an established (or establishing)
//! session. It never touches director state directly: every completion –
//! bind results, handshakes, decoded frames, disconnects – is marshaled
//! onto the tick thread as a [`LinkEvent`] and drained there. Outbound
//! frames go the other way through per-peer writer tasks, so the tick
//! thread never blocks on a slow socket.
//!
//! Host side:
//! 1. `HostLink::spawn` starts the accept loop; the bind outcome arrives as
//!    `HostBound` / `HostBindFailed`.
//! 2. Each accepted connection must open with a `Hello` frame. The password,
//!    protocol version, and capacity are checked and answered with a
//!    `HelloAck` before the peer exists anywhere else.
//! 3. Accepted peers start *inactive*: they receive directed sends (the
//!    buffered replay) but are excluded from broadcasts until the director
//!    calls [`HostLink::activate_peer`]. Both happen on the tick thread, so
//!    a replay can never interleave with a later broadcast.
//!
//! Client side: connect with timeout, `Hello`/`HelloAck` handshake, then a
//! read loop that auto-answers host pings.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use netplay_core::protocol::messages::{
    HelloAckMessage, HelloMessage, LeaveReason, PeerId, HEADER_SIZE, HOST_PEER_ID,
    PROTOCOL_VERSION,
};
use netplay_core::{decode_frame, encode_frame, ConnectError, Frame, SequenceCounter,
    SessionMessage};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// How long a freshly accepted connection gets to present its `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Completions marshaled from link tasks onto the tick thread.
#[derive(Debug)]
pub enum LinkEvent {
    /// Host side: the listener is up. Carries the actual bound port (useful
    /// when the caller asked for port 0).
    HostBound { port: u16 },
    /// Host side: the listener could not be bound.
    HostBindFailed { error: io::Error },
    /// Host side: a peer passed the hello handshake. The peer is inactive
    /// until the director activates it.
    PeerJoined { peer: PeerId, addr: SocketAddr },
    /// Host side: a peer is gone, voluntarily or not.
    PeerLeft { peer: PeerId, reason: LeaveReason },
    /// Client side: the handshake completed and the host assigned us an id
    /// and its current scene fence.
    ConnectSucceeded {
        assigned_peer: PeerId,
        scene_prefix: u32,
    },
    /// Client side: the connection attempt failed.
    ConnectFailed { reason: ConnectError },
    /// A decoded inbound frame. `from` is the sending peer on the host side
    /// and [`HOST_PEER_ID`] on the client side.
    Frame { from: PeerId, frame: Frame },
    /// Client side: the link to the host dropped.
    LinkDown { reason: LeaveReason },
}

/// Host-side handshake parameters.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub password: String,
    pub max_peers: usize,
}

struct PeerHandle {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Inactive peers receive directed sends only (the buffered replay),
    /// never broadcasts.
    active: bool,
}

struct HostShared {
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    seq: SequenceCounter,
    settings: HostSettings,
    next_peer: AtomicU32,
    /// Mirror of the director's scene fence, stamped into handshake acks.
    scene_prefix: AtomicU32,
}

/// Handle to a hosting session's listener and peer connections.
pub struct HostLink {
    shared: Arc<HostShared>,
    shutdown: watch::Sender<bool>,
}

impl HostLink {
    /// Starts the accept loop. Must be called within a Tokio runtime. The
    /// bind outcome arrives as a [`LinkEvent`] – this constructor never
    /// blocks the tick.
    pub fn spawn(
        port: u16,
        settings: HostSettings,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> HostLink {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(HostShared {
            peers: Mutex::new(HashMap::new()),
            events,
            seq: SequenceCounter::new(),
            settings,
            next_peer: AtomicU32::new(1),
            scene_prefix: AtomicU32::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            accept_loop(port, accept_shared, shutdown_rx).await;
        });

        HostLink {
            shared,
            shutdown: shutdown_tx,
        }
    }

    /// Queues a frame for one peer, active or not. Returns `false` when the
    /// peer is unknown or its writer is gone.
    pub fn send_to(&self, peer: PeerId, msg: &SessionMessage, scene_prefix: u32) -> bool {
        let bytes = match encode_frame(msg, self.shared.seq.next(), scene_prefix) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode frame for peer {peer}: {e}");
                return false;
            }
        };
        let peers = self.shared.peers.lock().unwrap();
        match peers.get(&peer) {
            Some(handle) => handle.tx.send(bytes).is_ok(),
            None => {
                warn!("send_to unknown peer {peer}");
                false
            }
        }
    }

    /// Queues a frame for every active peer.
    pub fn broadcast(&self, msg: &SessionMessage, scene_prefix: u32) {
        self.broadcast_except(None, msg, scene_prefix);
    }

    /// Queues a frame for every active peer except `except` (used when
    /// forwarding a client's own broadcast back out).
    pub fn broadcast_except(
        &self,
        except: Option<PeerId>,
        msg: &SessionMessage,
        scene_prefix: u32,
    ) {
        let bytes = match encode_frame(msg, self.shared.seq.next(), scene_prefix) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode broadcast frame: {e}");
                return;
            }
        };
        let peers = self.shared.peers.lock().unwrap();
        for (id, handle) in peers.iter() {
            if handle.active && Some(*id) != except {
                let _ = handle.tx.send(bytes.clone());
            }
        }
    }

    /// Keeps handshake acks stamped with the current scene fence. The
    /// director calls this on every scene load (and once at bind).
    pub fn set_scene_prefix(&self, prefix: u32) {
        self.shared.scene_prefix.store(prefix, Ordering::Relaxed);
    }

    /// Includes the peer in future broadcasts. Called on the tick thread
    /// after the buffered replay has been queued, which guarantees replayed
    /// frames precede any post-join broadcast on the peer's stream.
    pub fn activate_peer(&self, peer: PeerId) {
        if let Some(handle) = self.shared.peers.lock().unwrap().get_mut(&peer) {
            handle.active = true;
        }
    }

    /// Sends a goodbye frame and forgets the peer. Emits `PeerLeft` exactly
    /// once (the reader task finds the peer already removed).
    pub fn disconnect_peer(&self, peer: PeerId, reason: LeaveReason) {
        let removed = self.shared.peers.lock().unwrap().remove(&peer);
        if let Some(handle) = removed {
            if let Ok(bytes) = encode_frame(
                &SessionMessage::Disconnect { reason },
                self.shared.seq.next(),
                0,
            ) {
                let _ = handle.tx.send(bytes);
            }
            let _ = self
                .shared
                .events
                .send(LinkEvent::PeerLeft { peer, reason });
        }
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.shared.peers.lock().unwrap().get(&peer).map(|h| h.addr)
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().unwrap().len()
    }

    /// Says goodbye to every peer and stops the accept loop and all peer
    /// tasks.
    pub fn shutdown(&self, reason: LeaveReason) {
        {
            let mut peers = self.shared.peers.lock().unwrap();
            if let Ok(bytes) = encode_frame(
                &SessionMessage::Disconnect { reason },
                self.shared.seq.next(),
                0,
            ) {
                for handle in peers.values() {
                    let _ = handle.tx.send(bytes.clone());
                }
            }
            peers.clear();
        }
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(port: u16, shared: Arc<HostShared>, shutdown: watch::Receiver<bool>) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(error) => {
            let _ = shared.events.send(LinkEvent::HostBindFailed { error });
            return;
        }
    };
    let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
    let _ = shared.events.send(LinkEvent::HostBound { port: bound_port });
    info!("session listener on TCP {bound_port}");

    let mut accept_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            _ = accept_shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let peer_shared = Arc::clone(&shared);
                    let peer_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_peer(stream, addr, peer_shared, peer_shutdown).await;
                    });
                }
                Err(e) => warn!("accept error: {e}"),
            }
        }
    }
    debug!("session accept loop stopped");
}

async fn serve_peer(
    mut stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<HostShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    stream.set_nodelay(true).ok();

    let hello = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(Some(frame))) => frame,
        _ => {
            debug!("connection from {addr} closed before hello");
            return;
        }
    };
    let hello = match hello.message {
        SessionMessage::Hello(h) => h,
        other => {
            warn!(
                "connection from {addr} opened with {:?} instead of Hello",
                std::mem::discriminant(&other)
            );
            return;
        }
    };

    let verdict = {
        let peers = shared.peers.lock().unwrap();
        if hello.protocol_version != PROTOCOL_VERSION {
            Err(ConnectError::VersionMismatch)
        } else if hello.password != shared.settings.password {
            Err(ConnectError::Refused)
        } else if peers.len() >= shared.settings.max_peers {
            Err(ConnectError::Refused)
        } else {
            Ok(())
        }
    };

    let peer = match verdict {
        Err(reason) => {
            let ack = SessionMessage::HelloAck(HelloAckMessage {
                accepted: false,
                reason,
                peer_id: HOST_PEER_ID,
                scene_prefix: 0,
            });
            write_now(&mut stream, &shared.seq, &ack).await;
            info!("rejected connection from {addr}: {reason}");
            return;
        }
        Ok(()) => shared.next_peer.fetch_add(1, Ordering::Relaxed),
    };

    let ack = SessionMessage::HelloAck(HelloAckMessage {
        accepted: true,
        reason: ConnectError::NoError,
        peer_id: peer,
        scene_prefix: shared.scene_prefix.load(Ordering::Relaxed),
    });
    if !write_now(&mut stream, &shared.seq, &ack).await {
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    shared.peers.lock().unwrap().insert(
        peer,
        PeerHandle {
            addr,
            tx,
            active: false,
        },
    );
    let _ = shared.events.send(LinkEvent::PeerJoined { peer, addr });
    info!("peer {peer} joined from {addr} ({})", hello.display_name);

    tokio::spawn(write_loop(write_half, rx));

    let reason = host_read_loop(read_half, peer, &shared, &mut shutdown).await;

    // A kick (disconnect_peer) removes the peer first and emits the event
    // itself; only emit here when this reader is the one that noticed.
    if shared.peers.lock().unwrap().remove(&peer).is_some() {
        let _ = shared.events.send(LinkEvent::PeerLeft { peer, reason });
        info!("peer {peer} left: {reason:?}");
    }
}

async fn host_read_loop(
    mut reader: OwnedReadHalf,
    peer: PeerId,
    shared: &HostShared,
    shutdown: &mut watch::Receiver<bool>,
) -> LeaveReason {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return LeaveReason::HostShutdown,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => {
                    if let SessionMessage::Disconnect { reason } = frame.message {
                        return reason;
                    }
                    if shared
                        .events
                        .send(LinkEvent::Frame { from: peer, frame })
                        .is_err()
                    {
                        return LeaveReason::HostShutdown;
                    }
                }
                Ok(None) => return LeaveReason::Timeout,
                Err(e) => {
                    debug!("read error from peer {peer}: {e}");
                    return LeaveReason::ProtocolError;
                }
            }
        }
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

struct ClientShared {
    events: mpsc::UnboundedSender<LinkEvent>,
    seq: SequenceCounter,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// Handle to an outbound session connection.
pub struct ClientLink {
    shared: Arc<ClientShared>,
    shutdown: watch::Sender<bool>,
}

impl ClientLink {
    /// Starts the connect task. Must be called within a Tokio runtime. The
    /// outcome arrives as `ConnectSucceeded` / `ConnectFailed`.
    pub fn spawn(
        addr: SocketAddr,
        hello: HelloMessage,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> ClientLink {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            events,
            seq: SequenceCounter::new(),
            tx: Mutex::new(None),
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            run_client(addr, hello, connect_timeout, task_shared, shutdown_rx).await;
        });

        ClientLink {
            shared,
            shutdown: shutdown_tx,
        }
    }

    /// Queues a frame for the host. Returns `false` before the handshake
    /// completes or after the link dropped.
    pub fn send(&self, msg: &SessionMessage, scene_prefix: u32) -> bool {
        let bytes = match encode_frame(msg, self.shared.seq.next(), scene_prefix) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode client frame: {e}");
                return false;
            }
        };
        match &*self.shared.tx.lock().unwrap() {
            Some(tx) => tx.send(bytes).is_ok(),
            None => {
                debug!("client link not connected; dropping outbound frame");
                false
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        *self.shared.tx.lock().unwrap() = None;
    }
}

async fn run_client(
    addr: SocketAddr,
    hello: HelloMessage,
    connect_timeout: Duration,
    shared: Arc<ClientShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Err(_) => {
            let _ = shared.events.send(LinkEvent::ConnectFailed {
                reason: ConnectError::Timeout,
            });
            return;
        }
        Ok(Err(e)) => {
            let reason = if e.kind() == io::ErrorKind::ConnectionRefused {
                ConnectError::Refused
            } else {
                ConnectError::Unknown
            };
            debug!("connect to {addr} failed: {e}");
            let _ = shared.events.send(LinkEvent::ConnectFailed { reason });
            return;
        }
        Ok(Ok(stream)) => stream,
    };
    stream.set_nodelay(true).ok();

    if !write_now(&mut stream, &shared.seq, &SessionMessage::Hello(hello)).await {
        let _ = shared.events.send(LinkEvent::ConnectFailed {
            reason: ConnectError::Unknown,
        });
        return;
    }

    let ack = match timeout(connect_timeout, read_frame(&mut stream)).await {
        Ok(Ok(Some(Frame {
            message: SessionMessage::HelloAck(ack),
            ..
        }))) => ack,
        Err(_) => {
            let _ = shared.events.send(LinkEvent::ConnectFailed {
                reason: ConnectError::Timeout,
            });
            return;
        }
        _ => {
            let _ = shared.events.send(LinkEvent::ConnectFailed {
                reason: ConnectError::Unknown,
            });
            return;
        }
    };

    if !ack.accepted {
        let _ = shared.events.send(LinkEvent::ConnectFailed {
            reason: ack.reason,
        });
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    *shared.tx.lock().unwrap() = Some(tx.clone());
    tokio::spawn(write_loop(write_half, rx));

    let _ = shared.events.send(LinkEvent::ConnectSucceeded {
        assigned_peer: ack.peer_id,
        scene_prefix: ack.scene_prefix,
    });
    info!("connected to {addr} as peer {}", ack.peer_id);

    let reason = client_read_loop(read_half, &shared, tx, &mut shutdown).await;
    *shared.tx.lock().unwrap() = None;
    let _ = shared.events.send(LinkEvent::LinkDown { reason });
}

async fn client_read_loop(
    mut reader: OwnedReadHalf,
    shared: &ClientShared,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: &mut watch::Receiver<bool>,
) -> LeaveReason {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return LeaveReason::UserInitiated,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => {
                    // Answer pings immediately so host liveness tracking does
                    // not depend on the tick cadence. The frame is still
                    // forwarded: the director uses it as a host-is-alive sign.
                    if let SessionMessage::Ping(token) = frame.message {
                        if let Ok(bytes) =
                            encode_frame(&SessionMessage::Pong(token), shared.seq.next(), 0)
                        {
                            let _ = tx.send(bytes);
                        }
                    }
                    if let SessionMessage::Disconnect { reason } = frame.message {
                        return reason;
                    }
                    if shared
                        .events
                        .send(LinkEvent::Frame { from: HOST_PEER_ID, frame })
                        .is_err()
                    {
                        return LeaveReason::UserInitiated;
                    }
                }
                Ok(None) => return LeaveReason::Timeout,
                Err(e) => {
                    debug!("client read error: {e}");
                    return LeaveReason::ProtocolError;
                }
            }
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("write error: {e}");
            break;
        }
    }
    // Dropping the write half sends FIN; the remote reader sees EOF.
}

/// Encodes and writes one frame directly on a not-yet-split stream.
/// Handshake use only; transport frames carry prefix 0.
async fn write_now(stream: &mut TcpStream, seq: &SequenceCounter, msg: &SessionMessage) -> bool {
    match encode_frame(msg, seq.next(), 0) {
        Ok(bytes) => stream.write_all(&bytes).await.is_ok(),
        Err(e) => {
            error!("failed to encode frame: {e}");
            false
        }
    }
}

/// Reads one frame: the fixed header first, then the payload length the
/// header declares. Returns `Ok(None)` on a clean EOF at a frame boundary.
async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {payload_len} bytes exceeds limit"),
        ));
    }

    let mut full = vec![0u8; HEADER_SIZE + payload_len];
    full[..HEADER_SIZE].copy_from_slice(&header);
    if payload_len > 0 {
        reader.read_exact(&mut full[HEADER_SIZE..]).await?;
    }

    match decode_frame(&full) {
        Ok((frame, _)) => Ok(Some(frame)),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
