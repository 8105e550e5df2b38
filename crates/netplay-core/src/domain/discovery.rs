//! Discovered-game snapshots.
//!
//! A [`DiscoveredGame`] is produced by merging local-network discovery
//! results with wide-area directory entries. Snapshots are immutable and
//! rebuilt every poll cycle – never mutated in place – so a UI can hold a
//! list from the previous cycle without observing partial updates.

use std::net::SocketAddr;
use std::time::Duration;

/// One joinable session, as seen by the browsing peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredGame {
    /// Session transport endpoint to connect to.
    pub address: SocketAddr,
    /// Whether the host participates as a player.
    pub is_dedicated: bool,
    /// `true` when the entry came from local-network discovery rather than
    /// the wide-area directory.
    pub is_on_lan: bool,
    pub player_count: u32,
    pub max_player_count: u32,
    /// Measured or estimated round trip to the host. `None` when no probe
    /// completed (LAN entries are typically close enough not to bother).
    pub round_trip_estimate: Option<Duration>,
}

impl DiscoveredGame {
    /// A LAN entry built from a READY announcement. Player counts are not
    /// carried by the discovery broadcast, so they stay zero until the
    /// directory (or a join) fills them in.
    pub fn from_lan_announcement(address: SocketAddr) -> Self {
        Self {
            address,
            is_dedicated: false,
            is_on_lan: true,
            player_count: 0,
            max_player_count: 0,
            round_trip_estimate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lan_announcement_entry_is_marked_on_lan() {
        let addr: SocketAddr = "192.168.1.7:21182".parse().unwrap();
        let game = DiscoveredGame::from_lan_announcement(addr);
        assert!(game.is_on_lan);
        assert_eq!(game.address, addr);
        assert_eq!(game.round_trip_estimate, None);
    }
}
