//! VPN instance policy
//!
//! An [`Instance`] is one VPN endpoint as handed over by the instance
//! manager. The engine owns its default firewall policy and its tunnel
//! routing/DNS settings; port and subnet uniqueness are the instance
//! manager's business.

use crate::core::error::{Error, Result};
use crate::validators;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Fallback verdict when no group rule matches
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum DefaultPolicy {
    #[default]
    Accept,
    Drop,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TunnelMode {
    /// All client traffic goes through the tunnel
    #[default]
    Full,
    /// Only the configured routes go through the tunnel
    Split,
}

/// OpenVPN transport of an instance
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum VpnTransport {
    #[default]
    Udp,
    Tcp,
}

/// Split-tunnel route pushed to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Network,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub subnet: Ipv4Network,
    #[serde(default)]
    pub protocol: VpnTransport,
    #[serde(default)]
    pub tunnel_mode: TunnelMode,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Empty means the provider's resolvers
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub firewall_default_policy: DefaultPolicy,
}

impl Instance {
    /// Checks the fields the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty id or name, port 0, or
    /// routes/DNS servers that contradict the tunnel mode.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("id", "instance id cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::validation("name", "instance name cannot be empty"));
        }
        validators::validate_port(self.port).map_err(|e| Error::validation("port", e))?;
        match self.tunnel_mode {
            TunnelMode::Full if !self.routes.is_empty() => Err(Error::validation(
                "routes",
                "full tunnel instances cannot carry routes",
            )),
            TunnelMode::Split if !self.dns_servers.is_empty() => Err(Error::validation(
                "dns_servers",
                "split tunnel instances use the provider's DNS",
            )),
            _ => Ok(()),
        }
    }
}

/// Raw route as submitted by a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteDraft {
    pub network: String,
    pub interface: String,
}

/// Validated tunnel settings ready to be stored on an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub tunnel_mode: TunnelMode,
    pub routes: Vec<Route>,
    pub dns_servers: Vec<Ipv4Addr>,
}

/// Validates tunnel settings.
///
/// Full tunnel keeps the DNS servers and clears the routes; split tunnel
/// keeps the routes and clears the DNS servers.
///
/// # Errors
///
/// Returns [`Error::Validation`] for a route without network or interface,
/// a malformed CIDR or interface, or a DNS server that is not an IPv4 literal.
pub fn validate_network_settings(
    tunnel_mode: TunnelMode,
    routes: &[RouteDraft],
    dns_servers: &[String],
) -> Result<NetworkSettings> {
    match tunnel_mode {
        TunnelMode::Full => {
            let dns_servers = dns_servers
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| validators::parse_ipv4(s).map_err(|e| Error::validation("dns_servers", e)))
                .collect::<Result<Vec<_>>>()?;
            Ok(NetworkSettings {
                tunnel_mode,
                routes: Vec::new(),
                dns_servers,
            })
        }
        TunnelMode::Split => {
            let routes = routes
                .iter()
                .enumerate()
                .map(|(index, draft)| {
                    let field = format!("routes[{index}]");
                    if draft.network.trim().is_empty() || draft.interface.trim().is_empty() {
                        return Err(Error::validation(
                            field,
                            "every route needs a network and an interface",
                        ));
                    }
                    let network = validators::parse_ipv4_network(&draft.network)
                        .map_err(|e| Error::validation(field.clone(), e))?;
                    let interface = validators::validate_interface(&draft.interface)
                        .map_err(|e| Error::validation(field, e))?;
                    Ok(Route { network, interface })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(NetworkSettings {
                tunnel_mode,
                routes,
                dns_servers: Vec::new(),
            })
        }
    }
}
