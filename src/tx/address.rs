//! Address parsing
//!
//! Transparent addresses are base58 strings with a two-character network
//! prefix. Shielded addresses are Sapling bech32 strings. Parsing only checks
//! shape (prefix, length, alphabet); the node stays authoritative for
//! checksums via `validateaddress`.

use crate::node::config::Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const TRANSPARENT_LEN: usize = 35;
const SAPLING_MAINNET_HRP: &str = "zs1";
const SAPLING_TESTNET_HRP: &str = "ztestsapling1";
const SAPLING_MAINNET_LEN: usize = 78;
const SAPLING_TESTNET_LEN: usize = 88;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("'{0}' is not a valid transparent or shielded address")]
    Unrecognized(String),
    #[error("{address} is a {found} address but the wallet is on {expected}")]
    WrongNetwork {
        address: String,
        found: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Transparent,
    Shielded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Address {
    Transparent { encoded: String, network: Network },
    Shielded { encoded: String, network: Network },
}

impl Address {
    /// Parse an address for whichever network its prefix names
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some(network) = transparent_network(s) {
            return Ok(Address::Transparent {
                encoded: s.to_string(),
                network,
            });
        }
        if let Some(network) = shielded_network(s) {
            return Ok(Address::Shielded {
                encoded: s.to_string(),
                network,
            });
        }
        Err(AddressError::Unrecognized(s.to_string()))
    }

    /// Parse and require the address to belong to `network`
    pub fn parse_for(s: &str, network: Network) -> Result<Self, AddressError> {
        let address = Self::parse(s)?;
        if address.network() != network {
            return Err(AddressError::WrongNetwork {
                address: address.as_str().to_string(),
                found: address.network().as_str(),
                expected: network.as_str(),
            });
        }
        Ok(address)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Address::Transparent { encoded, .. } | Address::Shielded { encoded, .. } => encoded,
        }
    }

    pub fn network(&self) -> Network {
        match self {
            Address::Transparent { network, .. } | Address::Shielded { network, .. } => *network,
        }
    }

    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Transparent { .. } => AddressKind::Transparent,
            Address::Shielded { .. } => AddressKind::Shielded,
        }
    }

    pub fn is_shielded(&self) -> bool {
        matches!(self, Address::Shielded { .. })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn transparent_network(s: &str) -> Option<Network> {
    if s.len() != TRANSPARENT_LEN || !s.chars().all(|c| BASE58_ALPHABET.contains(c)) {
        return None;
    }
    match &s[..2] {
        "t1" | "t3" => Some(Network::Mainnet),
        "tm" | "t2" => Some(Network::Testnet),
        _ => None,
    }
}

fn shielded_network(s: &str) -> Option<Network> {
    let (network, data) = if let Some(data) = s.strip_prefix(SAPLING_TESTNET_HRP) {
        (Network::Testnet, data)
    } else if let Some(data) = s.strip_prefix(SAPLING_MAINNET_HRP) {
        (Network::Mainnet, data)
    } else {
        return None;
    };

    let expected_len = match network {
        Network::Mainnet => SAPLING_MAINNET_LEN,
        Network::Testnet => SAPLING_TESTNET_LEN,
    };
    if s.len() != expected_len || !data.chars().all(|c| BECH32_CHARSET.contains(c)) {
        return None;
    }
    Some(network)
}

/// Label lookup owned by the host application
pub trait AddressBook: Send + Sync {
    fn address_for(&self, label: &str) -> Option<String>;

    fn label_for(&self, address: &str) -> Option<String>;
}

/// Label to address
impl AddressBook for std::collections::BTreeMap<String, String> {
    fn address_for(&self, label: &str) -> Option<String> {
        self.get(label).cloned()
    }

    fn label_for(&self, address: &str) -> Option<String> {
        self.iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(label, _)| label.clone())
    }
}

/// Parse what the user typed into a recipient field, either an address or
/// an address-book label
pub fn resolve_recipient(input: &str, book: &dyn AddressBook, network: Network) -> Result<Address, AddressError> {
    let input = input.trim();
    match Address::parse_for(input, network) {
        Err(AddressError::Unrecognized(_)) => match book.address_for(input) {
            Some(address) => Address::parse_for(&address, network),
            None => Err(AddressError::Unrecognized(input.to_string())),
        },
        other => other,
    }
}
