//! This module defines types used to configure the engine and its parts.

use std::{net::Ipv4Addr, net::Ipv6Addr, path::PathBuf, str::FromStr, time::Duration};

use crate::error::Error;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The port the engine listens on for incoming peer connections and that
    /// is announced to trackers.
    pub listen_port: u16,

    /// The total number of peer connections the engine allows, across all
    /// torrents.
    pub max_connections: usize,

    /// Whether and how connections to peers are obfuscated.
    pub crypto: CryptoMode,

    /// The host's public IPv4 address, used to rank candidate peers. When
    /// not known, peers are ranked with a random key instead.
    pub local_v4: Option<Ipv4Addr>,

    /// The host's public IPv6 address, used like `local_v4`.
    pub local_v6: Option<Ipv6Addr>,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            listen_port: 50_413,
            max_connections: 500,
            crypto: CryptoMode::Prefer,
            local_v4: None,
            local_v6: None,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide an announce interval, we default to
    /// announcing every 30 minutes.
    pub announce_interval: Duration,

    /// Whether files are preallocated to their full length when the torrent
    /// is added. Without preallocation files are created sparse and grow as
    /// pieces are written.
    pub preallocate: bool,

    /// Whether pieces are always picked in index order rather than
    /// rarest-first.
    pub sequential_download: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(30 * 60),
            preallocate: true,
            sequential_download: false,
        }
    }
}

/// How the engine applies message stream encryption to peer connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoMode {
    /// Only encrypted connections are accepted or offered.
    Force,
    /// Both are offered; encryption is chosen when the peer supports it.
    Prefer,
    /// Both are offered; plaintext is chosen when the peer supports it.
    PreferPlaintext,
    /// No encryption, plaintext only.
    Disable,
}

impl FromStr for CryptoMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "force" => Ok(CryptoMode::Force),
            "" | "prefer" => Ok(CryptoMode::Prefer),
            "prefer-plaintext" => Ok(CryptoMode::PreferPlaintext),
            "disable" => Ok(CryptoMode::Disable),
            other => Err(Error::Config(format!(
                "invalid crypto mode {:?}, expected one of 'force', 'prefer', \
                 'prefer-plaintext' or 'disable'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_mode_from_str() {
        assert_eq!("force".parse::<CryptoMode>().unwrap(), CryptoMode::Force);
        assert_eq!("".parse::<CryptoMode>().unwrap(), CryptoMode::Prefer);
        assert_eq!(
            "prefer-plaintext".parse::<CryptoMode>().unwrap(),
            CryptoMode::PreferPlaintext
        );
        assert_eq!(
            "disable".parse::<CryptoMode>().unwrap(),
            CryptoMode::Disable
        );
        assert!("rot13".parse::<CryptoMode>().is_err());
    }
}
