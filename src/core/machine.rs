//! Machine-wide firewall rules
//!
//! Machine rules are not tied to a VPN group. They live in one global,
//! densely ordered sequence spanning the iptables tables and chains listed
//! in [`crate::core::rule_constraints::chains_for_table`]. For display they
//! are projected into [`ChainBucket`]s; the projection never owns order.

use crate::core::error::{Error, Result};
use crate::core::ordering::Ordered;
use crate::core::rule::{PortSpec, Protocol};
use crate::core::rule_constraints::{
    action_requires_translation_address, action_valid_for_table, bucket_for,
    chain_valid_for_table, chains_for_table, protocol_supports_ports,
};
use crate::validators;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

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
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

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
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Chain {
    Input,
    Output,
    Forward,
    Prerouting,
    Postrouting,
}

/// Target of a machine rule
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
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum MachineAction {
    Accept,
    Drop,
    Reject,
    Masquerade,
    Snat,
    Dnat,
}

impl MachineAction {
    pub fn is_nat(self) -> bool {
        matches!(
            self,
            MachineAction::Masquerade | MachineAction::Snat | MachineAction::Dnat
        )
    }
}

/// Display grouping of machine rules
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ChainBucket {
    Input,
    Output,
    Forward,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineRule {
    pub id: Uuid,
    /// Global position across every table and chain
    pub order: u32,
    pub table: Table,
    pub chain: Chain,
    pub action: MachineAction,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub source: Option<Ipv4Network>,
    /// Match address, or the translation address for SNAT/DNAT
    #[serde(default)]
    pub destination: Option<Ipv4Network>,
    #[serde(default)]
    pub port: Option<PortSpec>,
    #[serde(default)]
    pub in_interface: Option<String>,
    #[serde(default)]
    pub out_interface: Option<String>,
    /// Normalized conntrack state list, e.g. `RELATED,ESTABLISHED`
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub comment: String,
}

fn format_address(net: &Ipv4Network) -> String {
    if net.prefix() == 32 {
        net.ip().to_string()
    } else {
        format!("{}/{}", net.ip(), net.prefix())
    }
}

impl MachineRule {
    pub fn bucket(&self) -> ChainBucket {
        bucket_for(self.table, self.chain)
    }

    pub fn new(id: Uuid, order: u32, fields: MachineFields) -> Self {
        let mut rule = Self {
            id,
            order,
            table: fields.table,
            chain: fields.chain,
            action: fields.action,
            protocol: None,
            source: None,
            destination: None,
            port: None,
            in_interface: None,
            out_interface: None,
            state: None,
            comment: String::new(),
        };
        rule.apply_fields(fields);
        rule
    }

    /// Replaces every field except id and order.
    pub fn apply_fields(&mut self, fields: MachineFields) {
        self.table = fields.table;
        self.chain = fields.chain;
        self.action = fields.action;
        self.protocol = fields.protocol;
        self.source = fields.source;
        self.destination = fields.destination;
        self.port = fields.port;
        self.in_interface = fields.in_interface;
        self.out_interface = fields.out_interface;
        self.state = fields.state;
        self.comment = fields.comment;
    }

    /// Renders an advisory iptables command for operator confirmation.
    ///
    /// The output is never parsed back.
    pub fn preview(&self) -> String {
        let mut parts: Vec<String> = vec!["iptables".to_string()];

        if self.table != Table::Filter {
            parts.push("-t".to_string());
            parts.push(self.table.to_string());
        }
        parts.push("-A".to_string());
        parts.push(self.chain.to_string());

        if let Some(ref iface) = self.in_interface {
            parts.push("-i".to_string());
            parts.push(iface.clone());
        }
        if let Some(ref iface) = self.out_interface {
            parts.push("-o".to_string());
            parts.push(iface.clone());
        }
        if let Some(ref source) = self.source {
            parts.push("-s".to_string());
            parts.push(format_address(source));
        }

        let translates = action_requires_translation_address(self.action);
        if !translates && let Some(ref destination) = self.destination {
            parts.push("-d".to_string());
            parts.push(format_address(destination));
        }

        if let Some(protocol) = self.protocol.filter(|p| *p != Protocol::All) {
            parts.push("-p".to_string());
            parts.push(protocol.to_string());
            if protocol_supports_ports(protocol)
                && let Some(ref port) = self.port
            {
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

        if let Some(ref state) = self.state {
            parts.push("-m state --state".to_string());
            parts.push(state.clone());
        }
        if !self.comment.is_empty() {
            parts.push(format!("-m comment --comment \"{}\"", self.comment));
        }

        parts.push("-j".to_string());
        parts.push(self.action.to_string());

        if translates && let Some(ref destination) = self.destination {
            let flag = if self.action == MachineAction::Snat {
                "--to-source"
            } else {
                "--to-destination"
            };
            parts.push(flag.to_string());
            parts.push(format_address(destination));
        }

        parts.join(" ")
    }
}

impl Ordered for MachineRule {
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

/// Projects an ordered rule list into display buckets.
///
/// Every bucket is present, possibly empty, and keeps the global order.
pub fn bucketize(rules: &[MachineRule]) -> BTreeMap<ChainBucket, Vec<MachineRule>> {
    use strum::IntoEnumIterator;

    let mut buckets: BTreeMap<ChainBucket, Vec<MachineRule>> =
        ChainBucket::iter().map(|b| (b, Vec::new())).collect();
    let mut sorted = rules.to_vec();
    sorted.sort_by_key(|r| r.order);
    for rule in sorted {
        buckets.entry(rule.bucket()).or_default().push(rule);
    }
    buckets
}

/// Raw, caller-supplied machine rule fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineRuleDraft {
    #[serde(default)]
    pub table: Option<String>,
    pub chain: String,
    pub action: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub in_interface: Option<String>,
    #[serde(default)]
    pub out_interface: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Explicit global position; later rules shift down
    #[serde(default)]
    pub order: Option<u32>,
}

/// Validated machine rule fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineFields {
    pub table: Table,
    pub chain: Chain,
    pub action: MachineAction,
    pub protocol: Option<Protocol>,
    pub source: Option<Ipv4Network>,
    pub destination: Option<Ipv4Network>,
    pub port: Option<PortSpec>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub state: Option<String>,
    pub comment: String,
}

/// Treats missing, blank and `any` the same.
fn non_empty(value: Option<&String>) -> Option<&str> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("any"))
}

fn parse_address(field: &str, value: Option<&String>) -> Result<Option<Ipv4Network>> {
    non_empty(value)
        .map(|v| validators::parse_ipv4_network(v).map_err(|e| Error::validation(field, e)))
        .transpose()
}

fn parse_interface(field: &str, value: Option<&String>) -> Result<Option<String>> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| validators::validate_interface(v).map_err(|e| Error::validation(field, e)))
        .transpose()
}

impl MachineRuleDraft {
    /// Validates and normalizes every field.
    ///
    /// The table defaults to `filter`. Table, chain, action and protocol are
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first invalid field.
    pub fn validate(&self, strict_ports: bool) -> Result<MachineFields> {
        let table = match non_empty(self.table.as_ref()) {
            Some(raw) => raw
                .parse::<Table>()
                .map_err(|_| Error::validation("table", format!("unknown table '{raw}'")))?,
            None => Table::Filter,
        };

        let chain: Chain = self.chain.trim().parse().map_err(|_| {
            Error::validation("chain", format!("unknown chain '{}'", self.chain.trim()))
        })?;
        if !chain_valid_for_table(table, chain) {
            let valid: Vec<&str> = chains_for_table(table).iter().map(AsRef::as_ref).collect();
            return Err(Error::validation(
                "chain",
                format!(
                    "chain {chain} is not valid for table {table} (valid: {})",
                    valid.join(", ")
                ),
            ));
        }

        let action: MachineAction = self.action.trim().parse().map_err(|_| {
            Error::validation("action", format!("unknown action '{}'", self.action.trim()))
        })?;
        if !action_valid_for_table(action, table) {
            return Err(Error::validation(
                "action",
                format!("{action} is only valid in the nat table"),
            ));
        }

        let protocol = non_empty(self.protocol.as_ref())
            .map(|raw| {
                raw.parse::<Protocol>()
                    .map_err(|_| Error::validation("protocol", format!("unknown protocol '{raw}'")))
            })
            .transpose()?;

        let source = parse_address("source", self.source.as_ref())?;
        let destination = parse_address("destination", self.destination.as_ref())?;

        if action_requires_translation_address(action) {
            match destination {
                None => {
                    return Err(Error::validation(
                        "destination",
                        format!("{action} requires a destination address"),
                    ));
                }
                Some(net) if net.prefix() != 32 => {
                    return Err(Error::validation(
                        "destination",
                        format!("{action} needs a single address, not a network"),
                    ));
                }
                Some(_) => {}
            }
        }

        let raw_port = self
            .port
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let port = match raw_port {
            None => None,
            Some(raw) if protocol.is_some_and(protocol_supports_ports) => {
                Some(raw.parse::<PortSpec>().map_err(|e| Error::validation("port", e))?)
            }
            Some(raw) if strict_ports => {
                return Err(Error::validation(
                    "port",
                    format!("port '{raw}' requires protocol tcp or udp"),
                ));
            }
            Some(raw) => {
                tracing::warn!("Dropping port '{}' from machine rule without tcp/udp", raw);
                None
            }
        };

        let state = self
            .state
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| validators::parse_conntrack_states(s).map_err(|e| Error::validation("state", e)))
            .transpose()?;

        Ok(MachineFields {
            table,
            chain,
            action,
            protocol,
            source,
            destination,
            port,
            in_interface: parse_interface("in_interface", self.in_interface.as_ref())?,
            out_interface: parse_interface("out_interface", self.out_interface.as_ref())?,
            state,
            comment: validators::sanitize_comment(self.comment.as_deref().unwrap_or("")),
        })
    }
}
