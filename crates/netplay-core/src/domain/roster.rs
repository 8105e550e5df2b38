//! Player records and ban entries.
//!
//! The roster itself (the id → record map) lives in the roster server; these
//! are the entity types it stores. Ids are assigned by the host and unique
//! session-wide; insertion order is irrelevant.

use std::net::IpAddr;

/// Host-assigned player identifier. The host itself, when participating,
/// is id 0; connected peers count up from 1.
pub type PlayerId = u32;

/// One participating player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub display_name: String,
}

/// A banned source address. Session-lifetime only: the list is rebuilt empty
/// on every restart, a deliberate scoping decision rather than an oversight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BanEntry {
    pub ip_address: IpAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_entries_compare_by_address() {
        let a = BanEntry {
            ip_address: "10.0.0.1".parse().unwrap(),
        };
        let b = BanEntry {
            ip_address: "10.0.0.1".parse().unwrap(),
        };
        let c = BanEntry {
            ip_address: "10.0.0.2".parse().unwrap(),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
