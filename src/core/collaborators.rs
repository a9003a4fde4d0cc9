//! External services the engine calls
//!
//! The engine never allocates addresses or touches iptables itself. It
//! talks to an [`IpAllocator`] for member static addresses and to an
//! [`EnforcementDriver`] that materializes ordered rule lists. Both are
//! async traits so that the engine can bound every call with a timeout.

use crate::core::error::{Error, Result};
use crate::core::group::Member;
use crate::core::instance::Instance;
use crate::core::machine::MachineRule;
use crate::core::rule::Rule;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub const ALLOCATOR: &str = "IP allocator";
pub const DRIVER: &str = "Enforcement driver";

/// Static address allocation for VPN clients
#[async_trait]
pub trait IpAllocator: Send + Sync {
    /// Reserves a static address for `client_id` inside `subnet`.
    async fn allocate(&self, instance_name: &str, subnet: Ipv4Network, client_id: &str) -> Result<Ipv4Addr>;

    /// Returns the client's static address to the pool.
    async fn release(&self, instance_name: &str, client_id: &str) -> Result<()>;
}

/// Materializes policy on the gateway
#[async_trait]
pub trait EnforcementDriver: Send + Sync {
    /// Replaces the machine rules with `rules`, already in global order.
    async fn apply_machine_rules(&self, rules: &[MachineRule]) -> Result<()>;

    /// Replaces the per-client policy of one instance.
    async fn apply_instance_policy(&self, policy: &InstancePolicy) -> Result<()>;
}

/// One group's members and ordered rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupPolicy {
    pub group_id: String,
    pub members: Vec<Member>,
    pub rules: Vec<Rule>,
}

/// Everything the driver needs to enforce one instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstancePolicy {
    pub instance: Instance,
    pub groups: Vec<GroupPolicy>,
}

impl InstancePolicy {
    /// Advisory per-member command lines, group by group in rule order.
    pub fn preview(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for group in &self.groups {
            for member in &group.members {
                let Some(ip) = member.ip else { continue };
                lines.extend(group.rules.iter().map(|r| r.preview_for_member(ip)));
            }
        }
        lines
    }
}

/// Allocator used when no address subsystem is reachable
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineAllocator;

#[async_trait]
impl IpAllocator for OfflineAllocator {
    async fn allocate(&self, instance_name: &str, _subnet: Ipv4Network, client_id: &str) -> Result<Ipv4Addr> {
        Err(Error::collaborator(
            ALLOCATOR,
            format!("cannot allocate an address for {client_id} on {instance_name} while offline"),
        ))
    }

    async fn release(&self, instance_name: &str, client_id: &str) -> Result<()> {
        Err(Error::collaborator(
            ALLOCATOR,
            format!("cannot release the address of {client_id} on {instance_name} while offline"),
        ))
    }
}

/// Driver that only logs what would be applied
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDriver;

#[async_trait]
impl EnforcementDriver for LoggingDriver {
    async fn apply_machine_rules(&self, rules: &[MachineRule]) -> Result<()> {
        tracing::info!("Dry run: {} machine rules", rules.len());
        for rule in rules {
            tracing::debug!("{}", rule.preview());
        }
        Ok(())
    }

    async fn apply_instance_policy(&self, policy: &InstancePolicy) -> Result<()> {
        tracing::info!(
            "Dry run: instance {} default {} with {} groups",
            policy.instance.id,
            policy.instance.firewall_default_policy,
            policy.groups.len()
        );
        for line in policy.preview() {
            tracing::debug!("{}", line);
        }
        Ok(())
    }
}
