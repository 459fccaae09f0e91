//! Target network parameters.

use serde::{Deserialize, Serialize};

/// Networks the coordinator can settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Preprod,
}

impl Network {
    /// Ledger network id carried in the address header nibble.
    pub fn network_id(&self) -> u8 {
        match self {
            Network::Mainnet => 1,
            Network::Preprod => 0,
        }
    }

    /// Bech32 human-readable prefix for payment addresses.
    pub fn address_hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "addr",
            Network::Preprod => "addr_test",
        }
    }

    /// Convert a unix timestamp in milliseconds to the network slot number.
    ///
    /// Slot configs: mainnet slot 4_492_800 at unix 1_596_059_091, preprod
    /// slot 0 at unix 1_654_041_600. One-second slots on both.
    pub fn slot_at(&self, unix_ms: i64) -> u64 {
        let secs = unix_ms / 1000;
        let (zero_time, zero_slot) = match self {
            Network::Mainnet => (1_596_059_091i64, 4_492_800i64),
            Network::Preprod => (1_654_041_600i64, 0i64),
        };
        (secs - zero_time + zero_slot).max(0) as u64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "Mainnet",
            Network::Preprod => "Preprod",
        }
    }

    pub fn parse(s: &str) -> Option<Network> {
        match s {
            "Mainnet" => Some(Network::Mainnet),
            "Preprod" => Some(Network::Preprod),
            _ => None,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprod_slot_zero() {
        assert_eq!(Network::Preprod.slot_at(1_654_041_600_000), 0);
        assert_eq!(Network::Preprod.slot_at(1_654_041_601_000), 1);
    }

    #[test]
    fn test_mainnet_slot_offset() {
        assert_eq!(Network::Mainnet.slot_at(1_596_059_091_000), 4_492_800);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Network::parse("Preprod"), Some(Network::Preprod));
        assert_eq!(Network::parse("preview"), None);
    }
}
