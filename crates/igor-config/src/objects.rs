use std::net::IpAddr;

use serde::Deserialize;
use validator::Validate;

use igor_core::{IgorError, Result};

/// Local Diameter server identity and listener endpoint
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DiameterServerConfig {
    #[serde(rename = "bindAddress")]
    pub bind_address: String,
    #[serde(rename = "bindPort")]
    #[validate(range(min = 1))]
    pub bind_port: u16,
    #[serde(rename = "diameterHost")]
    #[validate(length(min = 1))]
    pub diameter_host: String,
    #[serde(rename = "diameterRealm")]
    #[validate(length(min = 1))]
    pub diameter_realm: String,
    #[serde(rename = "vendorId", default)]
    pub vendor_id: u32,
    #[serde(rename = "firmwareRevision", default)]
    pub firmware_revision: u32,
}

/// Who dials whom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPolicy {
    /// We establish the connection
    Active,
    /// The remote connects to our listener
    Passive,
}

/// Configuration for one Diameter peer
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DiameterPeerConfig {
    #[serde(rename = "diameterHost")]
    #[validate(length(min = 1))]
    pub diameter_host: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "port", default = "default_diameter_port")]
    pub port: u16,
    #[serde(rename = "connectionPolicy")]
    pub connection_policy: ConnectionPolicy,
    #[serde(rename = "connectionTimeoutMillis", default = "default_connection_timeout")]
    pub connection_timeout_millis: u64,
    #[serde(rename = "watchdogIntervalMillis", default = "default_watchdog_interval")]
    pub watchdog_interval_millis: u64,
    /// CIDR the remote address of a passive connection must fall in.
    /// When absent, the remote address must equal `ip_address`.
    #[serde(rename = "originNetwork", default)]
    pub origin_network: Option<String>,
}

fn default_diameter_port() -> u16 {
    3868
}

fn default_connection_timeout() -> u64 {
    5000
}

fn default_watchdog_interval() -> u64 {
    30000
}

/// The configured Diameter peer table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiameterPeersConfig(pub Vec<DiameterPeerConfig>);

impl DiameterPeersConfig {
    pub fn find_peer(&self, diameter_host: &str) -> Result<&DiameterPeerConfig> {
        self.0
            .iter()
            .find(|p| p.diameter_host == diameter_host)
            .ok_or_else(|| {
                IgorError::Protocol(format!("{diameter_host} not found in the peer table"))
            })
    }

    /// Validate the Origin-Host and remote address of an incoming
    /// connection against the configured peer table
    pub fn validate_incoming(&self, origin_host: &str, remote: IpAddr) -> bool {
        let Ok(peer) = self.find_peer(origin_host) else {
            return false;
        };
        match &peer.origin_network {
            Some(network) => network_contains(network, remote),
            None => peer
                .ip_address
                .parse::<IpAddr>()
                .map(|configured| configured == remote)
                .unwrap_or(false),
        }
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &DiameterPeerConfig> {
        self.0
            .iter()
            .filter(|p| p.connection_policy == ConnectionPolicy::Active)
    }
}

/// Peer selection policy of a routing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutePolicy {
    Fixed,
    RoundRobin,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self::Fixed
    }
}

/// One realm and application routing rule. The first matching rule of the
/// ordered list wins.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RoutingRuleConfig {
    /// Realm to match, or "*"
    #[serde(rename = "realm")]
    #[validate(length(min = 1))]
    pub realm: String,
    /// Application name to match, or "*"
    #[serde(rename = "applicationId")]
    #[validate(length(min = 1))]
    pub application_id: String,
    /// Handler peers by DiameterHost name
    #[serde(rename = "peers", default)]
    pub peers: Vec<String>,
    #[serde(rename = "policy", default)]
    pub policy: RoutePolicy,
    /// Try the next candidate peer on a retryable failure
    #[serde(rename = "retry", default)]
    pub retry: bool,
}

/// RADIUS server listener endpoint
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RadiusServerConfig {
    #[serde(rename = "bindAddress")]
    pub bind_address: String,
    #[serde(rename = "bindPort", default = "default_radius_port")]
    #[validate(range(min = 1))]
    pub bind_port: u16,
}

fn default_radius_port() -> u16 {
    1812
}

/// One RADIUS client entry: the shared secret for a source network
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RadiusClientConfig {
    #[serde(rename = "name")]
    pub name: String,
    /// IP address or CIDR
    #[serde(rename = "ipAddress")]
    #[validate(length(min = 1))]
    pub ip_address: String,
    #[serde(rename = "secret")]
    #[validate(length(min = 1))]
    pub secret: String,
}

/// The configured RADIUS clients table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RadiusClientsConfig(pub Vec<RadiusClientConfig>);

impl RadiusClientsConfig {
    /// Find the client entry for a source address
    pub fn find(&self, ip: IpAddr) -> Result<&RadiusClientConfig> {
        self.0
            .iter()
            .find(|client| {
                if client.ip_address.contains('/') {
                    network_contains(&client.ip_address, ip)
                } else {
                    client
                        .ip_address
                        .parse::<IpAddr>()
                        .map(|configured| configured == ip)
                        .unwrap_or(false)
                }
            })
            .ok_or_else(|| IgorError::UnknownClient(ip.to_string()))
    }
}

/// Check whether an address falls inside a CIDR network
pub fn network_contains(cidr: &str, ip: IpAddr) -> bool {
    let Some((network, prefix_len)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(network) = network.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix_len) = prefix_len.parse::<u32>() else {
        return false;
    };

    match (network, ip) {
        (IpAddr::V4(network), IpAddr::V4(ip)) => {
            if prefix_len > 32 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len)
            };
            u32::from(network) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(ip)) => {
            if prefix_len > 128 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - prefix_len)
            };
            u128::from(network) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}
