//! Core policy engine functionality
//!
//! This module contains the policy data model and the logic operating on it:
//!
//! - [`instance`]: VPN instances, their default policy and tunnel settings
//! - [`group`]: Groups of clients within one instance
//! - [`rule`]: Group ACL rules and their command preview
//! - [`machine`]: Gateway-wide iptables rules
//! - [`rule_constraints`]: Valid table/chain/action/protocol combinations
//! - [`ordering`]: Dense per-scope rule ordering
//! - [`resolver`]: First-match verdict resolution
//! - [`collaborators`]: IP allocator and enforcement driver interfaces
//! - [`store`]: Checksummed persistence of the policy state
//! - [`engine`]: Scoped locking and the operations built on all of the above
//! - [`error`]: Error types and user-facing translations

pub mod collaborators;
pub mod engine;
pub mod error;
pub mod group;
pub mod instance;
pub mod machine;
pub mod ordering;
pub mod resolver;
pub mod rule;
pub mod rule_constraints;
pub mod store;

#[cfg(test)]
pub mod test_helpers;
