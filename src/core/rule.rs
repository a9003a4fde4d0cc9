//! Group-scoped access rules
//!
//! A [`Rule`] is one ACL entry of a VPN group: what to do ([`Action`]) with
//! traffic of a [`Protocol`] towards a [`Destination`], optionally narrowed
//! to a [`PortSpec`]. Its `order` decides precedence inside the group and is
//! owned by the ordering engine (see [`crate::core::ordering`]).
//!
//! Callers submit a [`RuleDraft`] of raw strings; [`RuleDraft::validate`]
//! turns it into typed fields or a validation error naming the bad field.

use crate::core::error::{Error, Result};
use crate::core::ordering::Ordered;
use crate::core::rule_constraints::protocol_supports_ports;
use crate::validators;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/// Chain that receives the per-member group rules in command previews
pub const GROUP_FORWARD_CHAIN: &str = "VPN_sys_FORWARD";

/// Verdict a matching group rule produces
#[derive(
    Debug,
    Clone,
    Copy,
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
#[strum(ascii_case_insensitive)]
pub enum Action {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    /// Drop and answer with an ICMP error
    #[strum(serialize = "REJECT")]
    Reject,
}

/// Transport protocol a group rule applies to
#[derive(
    Debug,
    Clone,
    Copy,
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
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
    /// Matches every protocol
    #[strum(serialize = "all")]
    All,
}

impl Protocol {
    /// Returns `true` if a rule with protocol `self` covers a flow of `other`.
    pub fn covers(self, other: Protocol) -> bool {
        self == Protocol::All || self == other
    }
}

/// Destination of a group rule: `any` or an IPv4 address/network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Any,
    Network(Ipv4Network),
}

impl Destination {
    /// Prefix containment test; a bare address (`/32`) matches only itself.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        match self {
            Destination::Any => true,
            Destination::Network(net) => net.contains(addr),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Destination::Any)
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("any") {
            return Ok(Destination::Any);
        }
        validators::parse_ipv4_network(s).map(Destination::Network)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Any => write!(f, "any"),
            Destination::Network(net) if net.prefix() == 32 => write!(f, "{}", net.ip()),
            Destination::Network(net) => write!(f, "{}/{}", net.ip(), net.prefix()),
        }
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One entry of a port specification (a single port has `start == end`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortEntry {
    pub start: u16,
    pub end: u16,
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Port list of a rule: single ports and `start:end` ranges, comma separated
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortSpec(Vec<PortEntry>);

impl PortSpec {
    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|e| (e.start..=e.end).contains(&port))
    }

    /// Returns `true` when the port list needs the iptables multiport match.
    pub fn is_list(&self) -> bool {
        self.0.len() > 1
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let entries = validators::parse_port_spec(s)?
            .into_iter()
            .map(|(start, end)| PortEntry { start, end })
            .collect();
        Ok(Self(entries))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl Serialize for PortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: Uuid,
    pub group_id: String,
    pub order: u32,
    pub action: Action,
    pub protocol: Protocol,
    pub destination: Destination,
    /// Only ever set for TCP/UDP rules
    #[serde(default)]
    pub port: Option<PortSpec>,
    #[serde(default)]
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Rule {
    /// Renders the advisory iptables command applying this rule to one member.
    pub fn preview_for_member(&self, member_ip: Ipv4Addr) -> String {
        let mut parts = vec![
            "iptables".to_string(),
            "-A".to_string(),
            GROUP_FORWARD_CHAIN.to_string(),
            "-s".to_string(),
            member_ip.to_string(),
        ];
        if self.protocol != Protocol::All {
            parts.push("-p".to_string());
            parts.push(self.protocol.to_string());
            if let Some(ref port) = self.port {
                if port.is_list() {
                    parts.push("-m".to_string());
                    parts.push("multiport".to_string());
                    parts.push("--dports".to_string());
                } else {
                    parts.push("--dport".to_string());
                }
                parts.push(port.to_string());
            }
        }
        if !self.destination.is_any() {
            parts.push("-d".to_string());
            parts.push(self.destination.to_string());
        }
        parts.push("-j".to_string());
        parts.push(self.action.to_string());
        parts.join(" ")
    }

    /// Copies the caller-editable fields of `fields`, keeping id, group and order.
    pub fn apply_fields(&mut self, fields: RuleFields) {
        self.action = fields.action;
        self.protocol = fields.protocol;
        self.destination = fields.destination;
        self.port = fields.port;
        self.description = fields.description;
    }
}

impl Ordered for Rule {
    fn id(&self) -> Uuid {
        self.id
    }

    fn order(&self) -> u32 {
        self.order
    }

    fn set_order(&mut self, order: u32) {
        self.order = order;
    }
}

/// Raw, caller-supplied rule fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDraft {
    pub action: String,
    pub protocol: String,
    pub destination: String,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Explicit position; existing rules at or after it shift down
    #[serde(default)]
    pub order: Option<u32>,
}

/// Validated, typed rule fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFields {
    pub action: Action,
    pub protocol: Protocol,
    pub destination: Destination,
    pub port: Option<PortSpec>,
    pub description: String,
}

impl RuleDraft {
    /// Validates every field.
    ///
    /// A port given for a protocol other than TCP/UDP is rejected when
    /// `strict_ports` is set, otherwise it is dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first invalid field.
    pub fn validate(&self, strict_ports: bool) -> Result<RuleFields> {
        let action: Action = self
            .action
            .trim()
            .parse()
            .map_err(|_| Error::validation("action", format!("unknown action '{}'", self.action)))?;

        let protocol: Protocol = self.protocol.trim().parse().map_err(|_| {
            Error::validation("protocol", format!("unknown protocol '{}'", self.protocol))
        })?;

        let destination: Destination = self
            .destination
            .parse()
            .map_err(|e: String| Error::validation("destination", e))?;

        let raw_port = self
            .port
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());

        let port = match raw_port {
            None => None,
            Some(raw) if protocol_supports_ports(protocol) => Some(
                raw.parse::<PortSpec>()
                    .map_err(|e| Error::validation("port", e))?,
            ),
            Some(raw) if strict_ports => {
                return Err(Error::validation(
                    "port",
                    format!("port '{raw}' is not applicable to protocol '{protocol}'"),
                ));
            }
            Some(raw) => {
                tracing::warn!("Dropping port '{}' from {} rule", raw, protocol);
                None
            }
        };

        Ok(RuleFields {
            action,
            protocol,
            destination,
            port,
            description: validators::sanitize_comment(self.description.as_deref().unwrap_or("")),
        })
    }
}
