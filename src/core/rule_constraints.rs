//! Rule constraint functions for group and machine rules
//!
//! This module centralizes business logic about valid field combinations:
//! which protocols carry ports, which chains exist in which iptables table,
//! and which targets a table accepts. Validation in [`crate::core::rule`]
//! and [`crate::core::machine`] is built on these predicates.
//!
//! # Examples
//!
//! ```
//! use vpnpolicy::core::machine::{Chain, MachineAction, Table};
//! use vpnpolicy::core::rule::Protocol;
//! use vpnpolicy::core::rule_constraints::*;
//!
//! assert!(protocol_supports_ports(Protocol::Tcp));
//! assert!(!protocol_supports_ports(Protocol::Icmp));
//!
//! assert!(chain_valid_for_table(Table::Nat, Chain::Prerouting));
//! assert!(!chain_valid_for_table(Table::Nat, Chain::Input));
//!
//! assert!(action_valid_for_table(MachineAction::Masquerade, Table::Nat));
//! assert!(!action_valid_for_table(MachineAction::Masquerade, Table::Filter));
//! ```

use super::machine::{Chain, ChainBucket, MachineAction, Table};
use super::rule::Protocol;

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol supports port filtering.
///
/// Only TCP and UDP use ports. ICMP and "all" rules must not carry one.
///
/// # Examples
///
/// ```
/// use vpnpolicy::core::rule::Protocol;
/// use vpnpolicy::core::rule_constraints::protocol_supports_ports;
///
/// assert!(protocol_supports_ports(Protocol::Tcp));
/// assert!(protocol_supports_ports(Protocol::Udp));
/// assert!(!protocol_supports_ports(Protocol::All));
/// assert!(!protocol_supports_ports(Protocol::Icmp));
/// ```
#[inline]
pub fn protocol_supports_ports(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Tcp | Protocol::Udp)
}

// ═══════════════════════════════════════════════════════════════════════════
// Table / Chain Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns the built-in chains of an iptables table.
///
/// | table  | chains |
/// |--------|--------|
/// | filter | INPUT, OUTPUT, FORWARD |
/// | nat    | PREROUTING, POSTROUTING, OUTPUT |
/// | mangle | PREROUTING, INPUT, FORWARD, OUTPUT, POSTROUTING |
/// | raw    | PREROUTING, OUTPUT |
pub fn chains_for_table(table: Table) -> &'static [Chain] {
    match table {
        Table::Filter => &[Chain::Input, Chain::Output, Chain::Forward],
        Table::Nat => &[Chain::Prerouting, Chain::Postrouting, Chain::Output],
        Table::Mangle => &[
            Chain::Prerouting,
            Chain::Input,
            Chain::Forward,
            Chain::Output,
            Chain::Postrouting,
        ],
        Table::Raw => &[Chain::Prerouting, Chain::Output],
    }
}

/// Returns `true` if `chain` exists in `table`.
#[inline]
pub fn chain_valid_for_table(table: Table, chain: Chain) -> bool {
    chains_for_table(table).contains(&chain)
}

// ═══════════════════════════════════════════════════════════════════════════
// Target Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the target may be used in `table`.
///
/// MASQUERADE, SNAT and DNAT are NAT targets and only exist in the nat
/// table. ACCEPT, DROP and REJECT are accepted everywhere.
///
/// # Examples
///
/// ```
/// use vpnpolicy::core::machine::{MachineAction, Table};
/// use vpnpolicy::core::rule_constraints::action_valid_for_table;
///
/// assert!(action_valid_for_table(MachineAction::Snat, Table::Nat));
/// assert!(!action_valid_for_table(MachineAction::Dnat, Table::Mangle));
/// assert!(action_valid_for_table(MachineAction::Drop, Table::Raw));
/// ```
#[inline]
pub fn action_valid_for_table(action: MachineAction, table: Table) -> bool {
    !action.is_nat() || table == Table::Nat
}

/// Returns `true` if the target rewrites addresses to the rule's destination.
///
/// SNAT uses it as `--to-source`, DNAT as `--to-destination`, so the field
/// is mandatory for both and is not rendered as a `-d` match.
#[inline]
pub fn action_requires_translation_address(action: MachineAction) -> bool {
    matches!(action, MachineAction::Snat | MachineAction::Dnat)
}

// ═══════════════════════════════════════════════════════════════════════════
// Display Buckets
// ═══════════════════════════════════════════════════════════════════════════

/// Returns the display bucket of a machine rule.
///
/// Filter-table rules are grouped by chain; every other table lands in
/// [`ChainBucket::Other`].
///
/// # Examples
///
/// ```
/// use vpnpolicy::core::machine::{Chain, ChainBucket, Table};
/// use vpnpolicy::core::rule_constraints::bucket_for;
///
/// assert_eq!(bucket_for(Table::Filter, Chain::Forward), ChainBucket::Forward);
/// assert_eq!(bucket_for(Table::Nat, Chain::Output), ChainBucket::Other);
/// ```
pub fn bucket_for(table: Table, chain: Chain) -> ChainBucket {
    match (table, chain) {
        (Table::Filter, Chain::Input) => ChainBucket::Input,
        (Table::Filter, Chain::Output) => ChainBucket::Output,
        (Table::Filter, Chain::Forward) => ChainBucket::Forward,
        _ => ChainBucket::Other,
    }
}
