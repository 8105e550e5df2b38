//! netplay node entry point.
//!
//! Builds the process context, starts a LAN quickmatch (search, elect,
//! host-or-join), and drives the tick loop until Ctrl-C. The scheduler
//! loop is owned here – construction, ticking, and teardown are all
//! explicit and under this function's control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netplay_core::HostScope;
use netplay_node::application::director::{DirectorEvent, HostParams};
use netplay_node::infrastructure::config;
use netplay_node::infrastructure::discovery::DiscoveryDecision;
use netplay_node::{NodeContext, TickEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let node_config = config::load_config().context("loading configuration")?;

    // `RUST_LOG` overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(node_config.node.log_level.clone())),
        )
        .init();

    info!(
        "netplay node starting as {:?} (version {})",
        node_config.node.display_name, node_config.node.game_version
    );

    let tick_interval = node_config.tick_interval();
    let mut context = NodeContext::new(node_config);

    // Quickmatch: search the LAN; the election decides who hosts.
    context
        .begin_discovery(Instant::now())
        .context("starting LAN discovery")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_flag = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_flag.store(false, Ordering::Relaxed);
        }
    });

    let mut ticker = tokio::time::interval(tick_interval);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let now = Instant::now();
        for event in context.tick(now) {
            handle_event(&mut context, event);
        }
    }

    context.shutdown();
    info!("netplay node stopped");
    Ok(())
}

fn handle_event(context: &mut NodeContext, event: TickEvent) {
    match event {
        TickEvent::Discovery(DiscoveryDecision::Host) => {
            let cfg = context.config();
            let params = HostParams {
                max_peers: cfg.network.max_peers,
                port: cfg.network.session_port,
                dedicated: false,
                password: String::new(),
                scope: HostScope::Lan,
                session_name: format!("{}'s game", cfg.node.display_name),
            };
            info!("elected as host; starting a session");
            if let Err(e) = context.host_session(params) {
                error!("failed to start hosting: {e}");
            }
        }
        TickEvent::Discovery(DiscoveryDecision::Join(addr)) => {
            info!("joining the session at {addr}");
            if let Err(e) = context.connect_to_session(addr.ip(), addr.port(), "") {
                error!("failed to connect: {e}");
            }
        }
        TickEvent::Director(event) => match event {
            DirectorEvent::HostStarted { port } => info!("hosting on port {port}"),
            DirectorEvent::HostFailed { reason, detail } => {
                error!("hosting failed ({reason}): {detail}")
            }
            DirectorEvent::Connected { assigned_peer } => {
                info!("connected as peer {assigned_peer}")
            }
            DirectorEvent::ConnectFailed { reason } => error!("connect failed: {reason}"),
            DirectorEvent::Disconnected { reason } => info!("session ended: {reason:?}"),
            DirectorEvent::PeerJoined { peer, addr } => info!("peer {peer} joined from {addr}"),
            DirectorEvent::PeerLeft { peer, reason } => {
                info!("peer {peer} left ({reason:?})")
            }
            DirectorEvent::JoinRejected { reason } => error!("join rejected: {reason}"),
            DirectorEvent::SceneLoaded {
                scene_name,
                scene_prefix,
            } => info!("scene {scene_name:?} active under prefix {scene_prefix}"),
        },
    }
}
