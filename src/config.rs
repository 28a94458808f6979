//! # Node Configuration
//!
//! Validated runtime configuration for a router. Construction is
//! infallible; [`Config::validate`] runs at configure time and rejects
//! duplicates and nonsense before anything is wired up.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::identity::RouterId;
use crate::service::NetworkAddress;

/// Ready paths kept for name and introset lookups.
pub const DEFAULT_LOOKUP_PATHS: usize = 4;

/// Fatal configuration problems, surfaced at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `configure` was called twice.
    AlreadyConfigured,
    /// `setup`/`run` without a prior `configure`.
    NotConfigured,
    /// A value failed validation.
    Invalid(String),
    /// A duplicated entry (ons name, bootstrap peer).
    Duplicate(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::AlreadyConfigured => write!(f, "config already exists"),
            ConfigError::NotConfigured => write!(f, "context has no config"),
            ConfigError::Invalid(what) => write!(f, "invalid config: {what}"),
            ConfigError::Duplicate(what) => write!(f, "duplicated config entry: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A peer to join the network through: its address and identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub rid: RouterId,
    pub addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = ConfigError;

    /// Format: `IP:PORT/IDENTITYHEX`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .ok_or_else(|| ConfigError::Invalid("bootstrap peer must be IP:PORT/IDENTITY".into()))?;
        let addr: SocketAddr = addr_part
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad socket address: {addr_part}")))?;
        let rid = RouterId::from_hex(id_part)
            .map_err(|_| ConfigError::Invalid("identity must be 64 hex characters".into()))?;
        Ok(Self { rid, addr })
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Link bind address.
    pub bind: SocketAddr,
    /// Identity keys and node db live here.
    pub data_dir: PathBuf,
    /// Serve as a relay on other nodes' paths.
    pub allow_transit: bool,
    /// Advertise and grant exit service.
    pub allows_exit: bool,
    pub bootstrap: Vec<BootstrapPeer>,
    /// Ready paths kept by the lookup handler.
    pub num_lookup_paths: usize,
    /// Hops per path.
    pub hop_count: usize,
    /// Names this node answers `lookup_name` for.
    pub ons_records: Vec<(String, NetworkAddress)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:0".parse().expect("literal address parses"),
            data_dir: PathBuf::from("./umbra-data"),
            allow_transit: false,
            allows_exit: false,
            bootstrap: Vec::new(),
            num_lookup_paths: DEFAULT_LOOKUP_PATHS,
            hop_count: crate::path::DEFAULT_HOP_COUNT,
            ons_records: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_lookup_paths == 0 {
            return Err(ConfigError::Invalid("num_lookup_paths must be positive".into()));
        }
        if self.hop_count == 0 {
            return Err(ConfigError::Invalid("hop_count must be positive".into()));
        }
        let mut names = HashSet::new();
        for (name, _) in &self.ons_records {
            if !crate::service::is_valid_ons(name) {
                return Err(ConfigError::Invalid(format!("bad ons name: {name}")));
            }
            if !names.insert(name.as_str()) {
                return Err(ConfigError::Duplicate(format!("ons name {name}")));
            }
        }
        let mut peers = HashSet::new();
        for peer in &self.bootstrap {
            if !peers.insert(peer.rid) {
                return Err(ConfigError::Duplicate(format!("bootstrap peer {}", peer.rid)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn address() -> NetworkAddress {
        NetworkAddress::from_bytes(*Keypair::generate().router_id().as_bytes())
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn duplicate_ons_names_are_fatal() {
        let mut config = Config::default();
        config.ons_records = vec![
            ("alice.loki".into(), address()),
            ("alice.loki".into(), address()),
        ];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn invalid_ons_name_is_fatal() {
        let mut config = Config::default();
        config.ons_records = vec![("NotValid".into(), address())];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_bootstrap_peers_are_fatal() {
        let mut config = Config::default();
        let rid = Keypair::generate().router_id();
        let peer = BootstrapPeer {
            rid,
            addr: "127.0.0.1:9000".parse().unwrap(),
        };
        config.bootstrap = vec![peer.clone(), peer];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn bootstrap_peer_parses_addr_slash_identity() {
        let rid = Keypair::generate().router_id();
        let text = format!("127.0.0.1:7000/{}", rid.to_hex());
        let peer: BootstrapPeer = text.parse().unwrap();
        assert_eq!(peer.rid, rid);
        assert_eq!(peer.addr, "127.0.0.1:7000".parse().unwrap());
        assert!("127.0.0.1:7000".parse::<BootstrapPeer>().is_err());
        assert!("nope/abcd".parse::<BootstrapPeer>().is_err());
    }

    #[test]
    fn zero_paths_rejected() {
        let mut config = Config::default();
        config.num_lookup_paths = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
