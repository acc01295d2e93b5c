//! Shared data types

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::tiger::TigerHash;

/// Wire dialect of a hub or peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Legacy `$Command`-prefixed lines delimited by `|`.
    Nmdc,
    /// Four-letter commands delimited by `\n`.
    Adc,
}

impl Dialect {
    pub fn delimiter(self) -> u8 {
        match self {
            Dialect::Nmdc => b'|',
            Dialect::Adc => b'\n',
        }
    }
}

/// Peer-connection encryption policy. The effective mode between two peers
/// is the strictest of the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    RequireEncryption,
    #[default]
    PreferEncryption,
    DisableEncryption,
}

impl EncryptionMode {
    /// Whether a connection negotiated under (`self`, remote advertises TLS)
    /// uses TLS; `None` when the combination cannot connect at all.
    pub fn negotiate(self, remote_tls: bool) -> Option<bool> {
        match (self, remote_tls) {
            (EncryptionMode::RequireEncryption, true) => Some(true),
            (EncryptionMode::RequireEncryption, false) => None,
            (EncryptionMode::PreferEncryption, remote) => Some(remote),
            (EncryptionMode::DisableEncryption, _) => Some(false),
        }
    }
}

/// Elected role of a peer connection after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Upload => Direction::Download,
            Direction::Download => Direction::Upload,
        }
    }
}

/// Another client on the same hub.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    pub nick: String,
    pub description: String,
    pub email: String,
    pub client_tag: String,
    pub share_size: u64,
    pub ip: Option<IpAddr>,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub tls_port: u16,
    /// Advertises peer-connection TLS support.
    pub supports_tls: bool,
    /// Listens for inbound peer connections.
    pub is_active: bool,
    pub is_operator: bool,
    /// ADC session id, empty on legacy hubs.
    pub adc_sid: String,
    /// ADC client id, empty on legacy hubs.
    pub adc_cid: String,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nick)
    }
}

/// One entry of a peer's reply to a search.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub peer_nick: String,
    /// Hub-relative path of the matched file or directory.
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    pub tth: Option<TigerHash>,
    pub free_slots: u32,
    pub total_slots: u32,
}

/// What a search asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Substring match on file and directory names.
    Name {
        text: String,
        min_size: Option<u64>,
        max_size: Option<u64>,
    },
    /// Exact content-hash match.
    Tth(TigerHash),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_negotiation_is_strictest() {
        use EncryptionMode::*;
        assert_eq!(RequireEncryption.negotiate(true), Some(true));
        assert_eq!(RequireEncryption.negotiate(false), None);
        assert_eq!(PreferEncryption.negotiate(true), Some(true));
        assert_eq!(PreferEncryption.negotiate(false), Some(false));
        assert_eq!(DisableEncryption.negotiate(true), Some(false));
        assert_eq!(DisableEncryption.negotiate(false), Some(false));
    }
}
