//! Wide-area session directory client.
//!
//! A thin client for a registry service that hosts publish themselves to
//! and browsers query. Entries are keyed by a single `session_type_name`
//! string (typically title + version), used both to publish and to filter
//! queries. Results convert into [`DiscoveredGame`] records; merging them
//! with LAN discovery results is the caller's concern – the two sources are
//! deliberately independent.
//!
//! Wire protocol: one TCP connection per request, carrying a 4-byte
//! length-prefixed bincode frame each way. The transport sits behind
//! [`RegistryTransport`] so tests can substitute a mock.
//!
//! Round trips are estimated per entry by timing a TCP connect probe to the
//! entry's session endpoint; when the probe fails (host behind NAT, port
//! filtered) the query's own round trip stands in.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use netplay_core::DiscoveredGame;

/// Responses larger than this are rejected outright.
const MAX_RESPONSE_BYTES: usize = 1 << 20;

/// Error type for directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The registry could not be reached.
    #[error("failed to reach the registry at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// An I/O error occurred on an established registry connection.
    #[error("registry I/O error: {0}")]
    Io(#[from] io::Error),
    /// The registry did not answer in time.
    #[error("registry request timed out")]
    Timeout,
    /// A frame could not be encoded or decoded.
    #[error("registry frame error: {0}")]
    Frame(#[from] bincode::Error),
    /// The registry answered with the wrong response kind.
    #[error("unexpected registry response")]
    UnexpectedResponse,
}

/// What a host publishes about its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListing {
    pub session_name: String,
    pub comment: String,
    pub dedicated: bool,
    /// Publicly listed (scope `Public`) versus registered-but-unlisted
    /// (scope `Lan`).
    pub public: bool,
    /// Session transport port the host listens on.
    pub port: u16,
    pub player_count: u32,
    pub max_player_count: u32,
}

/// Requests understood by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryRequest {
    Register {
        instance: Uuid,
        session_type_name: String,
        listing: SessionListing,
    },
    Withdraw {
        instance: Uuid,
        session_type_name: String,
    },
    Query {
        session_type_name: String,
    },
}

/// One registry entry. The address combines the registrant's source IP (as
/// seen by the registry) with its published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub instance: Uuid,
    pub address: SocketAddr,
    pub session_name: String,
    pub comment: String,
    pub dedicated: bool,
    pub player_count: u32,
    pub max_player_count: u32,
}

/// Registry replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryResponse {
    Ack,
    Hosts(Vec<HostEntry>),
}

/// One request/response exchange with the registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn request(&self, request: RegistryRequest) -> Result<RegistryResponse, DirectoryError>;
}

/// The production transport: one short-lived TCP connection per request.
pub struct TcpRegistryTransport {
    addr: SocketAddr,
    request_timeout: Duration,
}

impl TcpRegistryTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl RegistryTransport for TcpRegistryTransport {
    async fn request(&self, request: RegistryRequest) -> Result<RegistryResponse, DirectoryError> {
        let mut stream = timeout(self.request_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| DirectoryError::Timeout)?
            .map_err(|source| DirectoryError::Connect {
                addr: self.addr,
                source,
            })?;

        let body = bincode::serialize(&request)?;
        stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
        stream.write_all(&body).await?;

        let mut len_buf = [0u8; 4];
        timeout(self.request_timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| DirectoryError::Timeout)??;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RESPONSE_BYTES {
            return Err(DirectoryError::UnexpectedResponse);
        }

        let mut body = vec![0u8; len];
        timeout(self.request_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| DirectoryError::Timeout)??;
        Ok(bincode::deserialize(&body)?)
    }
}

/// Publishes, withdraws, and queries session listings.
pub struct DirectoryClient {
    /// This node's registration identity; its own listing is filtered from
    /// query results.
    instance: Uuid,
    session_type_name: String,
    transport: Arc<dyn RegistryTransport>,
    probe_timeout: Duration,
}

impl DirectoryClient {
    pub fn new(session_type_name: &str, transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            instance: Uuid::new_v4(),
            session_type_name: session_type_name.to_string(),
            transport,
            probe_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn session_type_name(&self) -> &str {
        &self.session_type_name
    }

    /// Publishes (or refreshes) this node's listing. Registering again with
    /// the same instance id replaces the previous listing, which is how
    /// player counts are kept current.
    pub async fn publish(&self, listing: SessionListing) -> Result<(), DirectoryError> {
        let response = self
            .transport
            .request(RegistryRequest::Register {
                instance: self.instance,
                session_type_name: self.session_type_name.clone(),
                listing,
            })
            .await?;
        match response {
            RegistryResponse::Ack => Ok(()),
            _ => Err(DirectoryError::UnexpectedResponse),
        }
    }

    /// Removes this node's listing.
    pub async fn withdraw(&self) -> Result<(), DirectoryError> {
        let response = self
            .transport
            .request(RegistryRequest::Withdraw {
                instance: self.instance,
                session_type_name: self.session_type_name.clone(),
            })
            .await?;
        match response {
            RegistryResponse::Ack => Ok(()),
            _ => Err(DirectoryError::UnexpectedResponse),
        }
    }

    /// Queries the registry for sessions of this node's type, converted to
    /// [`DiscoveredGame`] snapshots with per-entry round-trip estimates.
    pub async fn query(&self) -> Result<Vec<DiscoveredGame>, DirectoryError> {
        let started = Instant::now();
        let response = self
            .transport
            .request(RegistryRequest::Query {
                session_type_name: self.session_type_name.clone(),
            })
            .await?;
        let query_rtt = started.elapsed();

        let RegistryResponse::Hosts(entries) = response else {
            return Err(DirectoryError::UnexpectedResponse);
        };

        let mut probes = JoinSet::new();
        for entry in entries {
            if entry.instance == self.instance {
                debug!("skipping own listing in query results");
                continue;
            }
            let limit = self.probe_timeout;
            probes.spawn(async move {
                let rtt = probe_rtt(entry.address, limit).await;
                (entry, rtt)
            });
        }

        let mut games = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let Ok((entry, probed)) = joined else { continue };
            games.push(DiscoveredGame {
                address: entry.address,
                is_dedicated: entry.dedicated,
                is_on_lan: false,
                player_count: entry.player_count,
                max_player_count: entry.max_player_count,
                round_trip_estimate: Some(probed.unwrap_or(query_rtt)),
            });
        }
        Ok(games)
    }

    /// Fire-and-forget publish for tick-thread callers; failures are logged.
    pub fn publish_background(self: &Arc<Self>, listing: SessionListing) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.publish(listing).await {
                warn!("directory publish failed: {e}");
            }
        });
    }

    /// Fire-and-forget withdraw for tick-thread callers.
    pub fn withdraw_background(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.withdraw().await {
                warn!("directory withdraw failed: {e}");
            }
        });
    }
}

/// Times a TCP connect to `addr`. `None` when the endpoint is unreachable
/// within `limit`.
async fn probe_rtt(addr: SocketAddr, limit: Duration) -> Option<Duration> {
    let started = Instant::now();
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
