//! End-to-end session tests over loopback TCP.
//!
//! These tests exercise the node through its public API only: a host
//! context and a client context, each driven by its own tick loop, talking
//! over real sockets on OS-assigned ports. They cover the observable
//! properties of the transport:
//!
//! - host/connect success and failure transitions of the mode state machine
//! - the join handshake (version check, ban list, assigned ids) and the
//!   roster broadcasts it produces on both sides
//! - buffered dispatch replay order for late joiners
//! - entity replication, scene-prefix propagation, kick/ban, disconnect
//!
//! Sessions are hosted with `scope: Private` so no directory registration
//! is attempted.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netplay_core::protocol::messages::{
    ArgKind, ArgValue, DispatchScope, DispatchTarget, Durability,
};
use netplay_core::{ConnectError, HostScope, TransportMode};
use netplay_node::application::director::{DirectorEvent, HostParams};
use netplay_node::infrastructure::config::NodeConfig;
use netplay_node::{NodeContext, TickEvent};

const LOCALHOST: &str = "127.0.0.1";
const DEADLINE: Duration = Duration::from_secs(5);

fn test_config(name: &str) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.display_name = name.to_string();
    cfg
}

fn private_host_params(port: u16) -> HostParams {
    HostParams {
        max_peers: 32,
        port,
        dedicated: false,
        password: String::new(),
        scope: HostScope::Private,
        session_name: "integration".to_string(),
    }
}

/// Ticks every node until `done` says so, panicking after the deadline.
async fn pump_until_state(
    nodes: &mut [&mut NodeContext],
    what: &str,
    mut done: impl FnMut(&[&mut NodeContext]) -> bool,
) {
    let deadline = Instant::now() + DEADLINE;
    loop {
        let now = Instant::now();
        for node in nodes.iter_mut() {
            node.tick(now);
        }
        if done(nodes) {
            return;
        }
        assert!(Instant::now() < deadline, "{what} within deadline");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Ticks every node until the watched node produces a matching director
/// event, which is returned.
async fn pump_until_event(
    nodes: &mut [&mut NodeContext],
    watch: usize,
    what: &str,
    mut matcher: impl FnMut(&DirectorEvent) -> bool,
) -> DirectorEvent {
    let deadline = Instant::now() + DEADLINE;
    loop {
        let now = Instant::now();
        for (i, node) in nodes.iter_mut().enumerate() {
            for event in node.tick(now) {
                if i == watch {
                    if let TickEvent::Director(event) = event {
                        if matcher(&event) {
                            return event;
                        }
                    }
                }
            }
        }
        assert!(Instant::now() < deadline, "{what} within deadline");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Hosts on an ephemeral port and returns the bound port.
async fn start_private_host(host: &mut NodeContext) -> u16 {
    host.host_session(private_host_params(0)).expect("host");
    let event = pump_until_event(&mut [host], 0, "host start", |e| {
        matches!(
            e,
            DirectorEvent::HostStarted { .. } | DirectorEvent::HostFailed { .. }
        )
    })
    .await;
    match event {
        DirectorEvent::HostStarted { port } => port,
        other => panic!("hosting failed: {other:?}"),
    }
}

/// Connects `client` to the host and drives both until the roster settles
/// on each side (host self + client = 2 players).
async fn join(host: &mut NodeContext, client: &mut NodeContext, port: u16) {
    client
        .connect_to_session(LOCALHOST.parse::<IpAddr>().unwrap(), port, "")
        .expect("connect");
    pump_until_state(&mut [host, client], "join handshake", |nodes| {
        nodes[0].roster().player_count() == 2 && nodes[1].roster().player_count() == 2
    })
    .await;
}

/// Registers a recording command on a node's table; every node that should
/// observe the command needs its own registration.
fn install_recorder(node: &mut NodeContext, name: &str) -> Arc<Mutex<Vec<i32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    node.director_mut()
        .registry_mut()
        .register(
            name,
            vec![ArgKind::Int],
            Box::new(move |_, args, _| {
                if let ArgValue::Int(v) = &args[0] {
                    sink.lock().unwrap().push(*v);
                }
            }),
        )
        .expect("register recorder");
    seen
}

// ── State machine ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_host_session_success_transitions_to_hosting() {
    let mut host = NodeContext::new(test_config("host"));

    host.host_session(private_host_params(0)).expect("host");
    assert_eq!(host.director().mode(), TransportMode::Connecting);

    let event = pump_until_event(&mut [&mut host], 0, "host start", |e| {
        matches!(e, DirectorEvent::HostStarted { .. })
    })
    .await;
    if let DirectorEvent::HostStarted { port } = event {
        assert!(port > 0, "OS-assigned port must be reported");
    }
    assert_eq!(host.director().mode(), TransportMode::Hosting);

    host.shutdown();
    assert_eq!(host.director().mode(), TransportMode::Idle);
}

#[tokio::test]
async fn test_host_bind_failure_returns_to_idle_with_reason() {
    // Occupy a port first so the bind must fail.
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").expect("blocker bind");
    let taken_port = blocker.local_addr().unwrap().port();

    let mut host = NodeContext::new(test_config("host"));
    host.host_session(private_host_params(taken_port))
        .expect("host call itself succeeds; the failure is asynchronous");

    let event = pump_until_event(&mut [&mut host], 0, "host failure", |e| {
        matches!(e, DirectorEvent::HostFailed { .. })
    })
    .await;
    if let DirectorEvent::HostFailed { reason, .. } = event {
        assert_eq!(reason, ConnectError::Refused);
    }
    assert_eq!(host.director().mode(), TransportMode::Idle);
}

#[tokio::test]
async fn test_connect_to_dead_port_fails_back_to_idle() {
    // Bind-then-drop guarantees nothing listens on the port.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut client = NodeContext::new(test_config("client"));
    client
        .connect_to_session(LOCALHOST.parse::<IpAddr>().unwrap(), dead_port, "")
        .expect("connect");

    let event = pump_until_event(&mut [&mut client], 0, "connect failure", |e| {
        matches!(e, DirectorEvent::ConnectFailed { .. })
    })
    .await;
    if let DirectorEvent::ConnectFailed { reason } = event {
        assert_eq!(reason, ConnectError::Refused);
    }
    assert_eq!(client.director().mode(), TransportMode::Idle);
}

// ── Join handshake and roster ─────────────────────────────────────────────────

#[tokio::test]
async fn test_join_handshake_builds_matching_rosters() {
    let mut host = NodeContext::new(test_config("ada"));
    let mut client = NodeContext::new(test_config("grace"));

    let port = start_private_host(&mut host).await;
    join(&mut host, &mut client, port).await;

    assert_eq!(host.director().mode(), TransportMode::Hosting);
    assert_eq!(client.director().mode(), TransportMode::Client);
    assert_eq!(client.roster().local_player(), Some(1));

    // Same membership on both sides: host is player 0, client is player 1.
    for node in [&host, &client] {
        let mut players = node.roster().players();
        players.sort_by_key(|p| p.id);
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].id, 0);
        assert_eq!(players[0].display_name, "ada");
        assert_eq!(players[1].id, 1);
        assert_eq!(players[1].display_name, "grace");
    }

    client.shutdown();
    host.shutdown();
}

#[tokio::test]
async fn test_wrong_password_is_refused_at_the_transport() {
    let mut host = NodeContext::new(test_config("host"));
    let mut params = private_host_params(0);
    params.password = "sesame".to_string();
    host.host_session(params).expect("host");
    let port = match pump_until_event(&mut [&mut host], 0, "host start", |e| {
        matches!(e, DirectorEvent::HostStarted { .. })
    })
    .await
    {
        DirectorEvent::HostStarted { port } => port,
        _ => unreachable!(),
    };

    let mut client = NodeContext::new(test_config("client"));
    client
        .connect_to_session(LOCALHOST.parse::<IpAddr>().unwrap(), port, "wrong")
        .expect("connect");

    let event = pump_until_event(&mut [&mut host, &mut client], 1, "refusal", |e| {
        matches!(e, DirectorEvent::ConnectFailed { .. })
    })
    .await;
    if let DirectorEvent::ConnectFailed { reason } = event {
        assert_eq!(reason, ConnectError::Refused);
    }
    assert_eq!(client.director().mode(), TransportMode::Idle);
    host.shutdown();
}

#[tokio::test]
async fn test_version_mismatch_join_is_rejected_and_client_disconnects() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client_cfg = test_config("client");
    client_cfg.node.game_version = "9.9.9".to_string();
    let mut client = NodeContext::new(client_cfg);

    let port = start_private_host(&mut host).await;
    client
        .connect_to_session(LOCALHOST.parse::<IpAddr>().unwrap(), port, "")
        .expect("connect");

    let event = pump_until_event(&mut [&mut host, &mut client], 1, "rejection", |e| {
        matches!(e, DirectorEvent::JoinRejected { .. })
    })
    .await;
    if let DirectorEvent::JoinRejected { reason } = event {
        assert_eq!(reason, ConnectError::VersionMismatch);
    }

    pump_until_state(&mut [&mut host, &mut client], "client back to idle", |nodes| {
        nodes[1].director().mode() == TransportMode::Idle
    })
    .await;

    // The host keeps only its own record; the rejected peer never joined.
    assert_eq!(host.roster().player_count(), 1);
    host.shutdown();
}

#[tokio::test]
async fn test_banned_address_join_is_rejected() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let port = start_private_host(&mut host).await;
    host.roster().ban_address(LOCALHOST.parse().unwrap());

    client
        .connect_to_session(LOCALHOST.parse::<IpAddr>().unwrap(), port, "")
        .expect("connect");

    let event = pump_until_event(&mut [&mut host, &mut client], 1, "rejection", |e| {
        matches!(e, DirectorEvent::JoinRejected { .. })
    })
    .await;
    if let DirectorEvent::JoinRejected { reason } = event {
        assert_eq!(reason, ConnectError::Banned);
    }
    host.shutdown();
}

#[tokio::test]
async fn test_kick_with_ban_removes_player_and_blocks_rejoin() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let port = start_private_host(&mut host).await;
    join(&mut host, &mut client, port).await;

    assert!(host.kick(1, true), "kick must find the player");
    pump_until_state(&mut [&mut host, &mut client], "kick settles", |nodes| {
        nodes[0].roster().player_count() == 1
            && nodes[1].director().mode() == TransportMode::Idle
    })
    .await;
    assert!(host.roster().is_banned(LOCALHOST.parse().unwrap()));

    // The kicked address is refused at the join handshake from now on.
    client
        .connect_to_session(LOCALHOST.parse::<IpAddr>().unwrap(), port, "")
        .expect("connect");
    let event = pump_until_event(&mut [&mut host, &mut client], 1, "re-join rejection", |e| {
        matches!(e, DirectorEvent::JoinRejected { .. })
    })
    .await;
    if let DirectorEvent::JoinRejected { reason } = event {
        assert_eq!(reason, ConnectError::Banned);
    }
    host.shutdown();
}

#[tokio::test]
async fn test_client_disconnect_unregisters_it_on_the_host() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let port = start_private_host(&mut host).await;
    join(&mut host, &mut client, port).await;

    client.disconnect().expect("disconnect");
    pump_until_state(&mut [&mut host, &mut client], "departure settles", |nodes| {
        nodes[0].roster().player_count() == 1 && nodes[1].roster().player_count() == 0
    })
    .await;

    assert_eq!(client.director().mode(), TransportMode::Idle);
    assert_eq!(host.director().mode(), TransportMode::Hosting);
    host.shutdown();
}

// ── Buffered dispatch and replay ──────────────────────────────────────────────

#[tokio::test]
async fn test_late_joiner_replays_buffered_dispatches_in_send_order() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let host_seen = install_recorder(&mut host, "test.note");
    let client_seen = install_recorder(&mut client, "test.note");

    let port = start_private_host(&mut host).await;

    // Five buffered broadcasts before the client exists.
    for i in 0..5 {
        host.director_mut()
            .dispatch(
                DispatchTarget::Session,
                "test.note",
                vec![ArgValue::Int(i)],
                Durability::Buffered,
                DispatchScope::All,
            )
            .expect("dispatch");
    }
    assert_eq!(*host_seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    join(&mut host, &mut client, port).await;

    // One more after the join completed.
    host.director_mut()
        .dispatch(
            DispatchTarget::Session,
            "test.note",
            vec![ArgValue::Int(99)],
            Durability::Buffered,
            DispatchScope::All,
        )
        .expect("dispatch");

    pump_until_state(&mut [&mut host, &mut client], "replay delivery", |_| {
        client_seen.lock().unwrap().len() == 6
    })
    .await;

    // All five pre-join dispatches, in original send order, strictly
    // before the post-join one.
    assert_eq!(*client_seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 99]);
    host.shutdown();
}

#[tokio::test]
async fn test_transient_dispatch_is_not_replayed_to_late_joiners() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    install_recorder(&mut host, "test.note");
    let client_seen = install_recorder(&mut client, "test.note");

    let port = start_private_host(&mut host).await;
    host.director_mut()
        .dispatch(
            DispatchTarget::Session,
            "test.note",
            vec![ArgValue::Int(7)],
            Durability::Transient,
            DispatchScope::All,
        )
        .expect("dispatch");

    join(&mut host, &mut client, port).await;

    // Something observable after the join, to bound the wait.
    host.director_mut()
        .dispatch(
            DispatchTarget::Session,
            "test.note",
            vec![ArgValue::Int(8)],
            Durability::Buffered,
            DispatchScope::All,
        )
        .expect("dispatch");
    pump_until_state(&mut [&mut host, &mut client], "post-join delivery", |_| {
        !client_seen.lock().unwrap().is_empty()
    })
    .await;

    assert_eq!(
        *client_seen.lock().unwrap(),
        vec![8],
        "the transient dispatch must not reach a peer that joined later"
    );
    host.shutdown();
}

#[tokio::test]
async fn test_client_broadcast_reaches_host_without_echo() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let host_seen = install_recorder(&mut host, "test.note");
    let client_seen = install_recorder(&mut client, "test.note");

    let port = start_private_host(&mut host).await;
    join(&mut host, &mut client, port).await;

    client
        .director_mut()
        .dispatch(
            DispatchTarget::Session,
            "test.note",
            vec![ArgValue::Int(41)],
            Durability::Transient,
            DispatchScope::All,
        )
        .expect("dispatch");

    pump_until_state(&mut [&mut host, &mut client], "host receives", |_| {
        !host_seen.lock().unwrap().is_empty()
    })
    .await;

    assert_eq!(*host_seen.lock().unwrap(), vec![41]);
    assert_eq!(
        *client_seen.lock().unwrap(),
        vec![41],
        "an All dispatch executes exactly once on the sender"
    );
    host.shutdown();
}

// ── Entities ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_entity_spawned_before_join_materialises_on_late_joiner() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let port = start_private_host(&mut host).await;
    let crate_id = host
        .director_mut()
        .instantiate("props/crate", [1.0, 0.0, 2.0], [0.0, 0.0, 0.0, 1.0], 0)
        .expect("instantiate");

    join(&mut host, &mut client, port).await;
    pump_until_state(&mut [&mut host, &mut client], "spawn replication", |nodes| {
        nodes[1].director().entity_count() == 1
    })
    .await;
    assert_eq!(
        client.director().entity(crate_id).unwrap().descriptor,
        "props/crate"
    );

    // Destroy drops it everywhere and removes the buffered spawn.
    host.director_mut().destroy(crate_id).expect("destroy");
    pump_until_state(&mut [&mut host, &mut client], "destroy replication", |nodes| {
        nodes[0].director().entity_count() == 0 && nodes[1].director().entity_count() == 0
    })
    .await;
    host.shutdown();
}

#[tokio::test]
async fn test_client_spawned_entity_replicates_to_host() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let port = start_private_host(&mut host).await;
    join(&mut host, &mut client, port).await;

    let id = client
        .director_mut()
        .instantiate("actors/avatar", [0.0; 3], [0.0, 0.0, 0.0, 1.0], 1)
        .expect("instantiate");
    assert_eq!(id.owner, 1, "entities are stamped with the spawning peer");

    pump_until_state(&mut [&mut host, &mut client], "client spawn reaches host", |nodes| {
        nodes[0].director().entity_count() == 1
    })
    .await;
    host.shutdown();
}

// ── Scene loads ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_scene_load_propagates_strictly_increasing_prefix() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let port = start_private_host(&mut host).await;
    join(&mut host, &mut client, port).await;

    let first = host.director_mut().load_scene("arena01").expect("load");
    let event = pump_until_event(&mut [&mut host, &mut client], 1, "scene load", |e| {
        matches!(e, DirectorEvent::SceneLoaded { .. })
    })
    .await;
    if let DirectorEvent::SceneLoaded {
        scene_name,
        scene_prefix,
    } = event
    {
        assert_eq!(scene_name, "arena01");
        assert_eq!(scene_prefix, first);
    }
    assert_eq!(client.director().scene_prefix(), first);

    let second = host.director_mut().load_scene("arena02").expect("load");
    assert!(second > first, "prefix must strictly increase");
    pump_until_state(&mut [&mut host, &mut client], "second scene", |nodes| {
        nodes[1].director().scene_prefix() == second
    })
    .await;
    host.shutdown();
}

#[tokio::test]
async fn test_joiner_after_scene_load_adopts_current_prefix() {
    let mut host = NodeContext::new(test_config("host"));
    let mut client = NodeContext::new(test_config("client"));

    let port = start_private_host(&mut host).await;
    let prefix = host.director_mut().load_scene("arena01").expect("load");

    join(&mut host, &mut client, port).await;
    assert_eq!(
        client.director().scene_prefix(),
        prefix,
        "the handshake hands the fence to the joiner"
    );
    host.shutdown();
}
