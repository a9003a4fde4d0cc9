//! Shared test utilities for core module tests
//!
//! Provides common builders and stateful collaborator mocks.
//! This module is only compiled in test mode.

use crate::core::collaborators::{EnforcementDriver, InstancePolicy, IpAllocator};
use crate::core::engine::{EngineOptions, PolicyEngine};
use crate::core::error::{Error, Result};
use crate::core::group::Group;
use crate::core::instance::{DefaultPolicy, Instance, TunnelMode, VpnTransport};
use crate::core::machine::{MachineRule, MachineRuleDraft};
use crate::core::rule::{Rule, RuleDraft};
use async_trait::async_trait;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Builds a validated rule in group `test_group`.
pub fn make_rule(order: u32, action: &str, protocol: &str, destination: &str, port: Option<&str>) -> Rule {
    make_rule_in("test_group", order, action, protocol, destination, port)
}

/// Builds a validated rule in `group_id`.
pub fn make_rule_in(
    group_id: &str,
    order: u32,
    action: &str,
    protocol: &str,
    destination: &str,
    port: Option<&str>,
) -> Rule {
    let fields = rule_draft(action, protocol, destination, port)
        .validate(true)
        .expect("test rule must be valid");
    Rule {
        id: Uuid::new_v4(),
        group_id: group_id.to_string(),
        order,
        action: fields.action,
        protocol: fields.protocol,
        destination: fields.destination,
        port: fields.port,
        description: fields.description,
        created_at: Utc::now(),
    }
}

pub fn rule_draft(action: &str, protocol: &str, destination: &str, port: Option<&str>) -> RuleDraft {
    RuleDraft {
        action: action.to_string(),
        protocol: protocol.to_string(),
        destination: destination.to_string(),
        port: port.map(str::to_string),
        description: None,
        order: None,
    }
}

pub fn machine_draft(table: &str, chain: &str, action: &str) -> MachineRuleDraft {
    MachineRuleDraft {
        table: Some(table.to_string()),
        chain: chain.to_string(),
        action: action.to_string(),
        ..MachineRuleDraft::default()
    }
}

/// Builds an instance whose name equals its id.
pub fn make_instance(id: &str, subnet: &str, policy: &str) -> Instance {
    Instance {
        id: id.to_string(),
        name: id.to_string(),
        port: 1194,
        subnet: subnet.parse().expect("test subnet"),
        protocol: VpnTransport::Udp,
        tunnel_mode: TunnelMode::Full,
        routes: Vec::new(),
        dns_servers: Vec::new(),
        firewall_default_policy: policy.parse::<DefaultPolicy>().expect("test policy"),
    }
}

pub fn make_group(instance_id: &str, name: &str) -> Group {
    Group {
        id: Group::make_id(instance_id, name),
        name: name.to_string(),
        description: String::new(),
        instance_id: instance_id.to_string(),
        members: Vec::new(),
        created_at: Utc::now(),
    }
}

/// Engine with fast timeouts and fresh mocks.
pub fn test_engine() -> (PolicyEngine, MockAllocator, MockDriver) {
    let allocator = MockAllocator::new();
    let driver = MockDriver::new();
    let engine = PolicyEngine::new(
        Arc::new(allocator.clone()),
        Arc::new(driver.clone()),
        EngineOptions {
            lock_timeout: Duration::from_millis(200),
            collaborator_timeout: Duration::from_millis(200),
            ..EngineOptions::default()
        },
    );
    (engine, allocator, driver)
}

// ============================================================================
// MockAllocator
// ============================================================================

#[derive(Debug, Default)]
pub struct AllocatorState {
    /// (instance_name, client) -> address
    pub leases: HashMap<(String, String), Ipv4Addr>,
    pub allocate_calls: usize,
    pub released: Vec<(String, String)>,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
    /// Delay before answering, to exercise timeouts
    pub delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockAllocator {
    pub state: Arc<Mutex<AllocatorState>>,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .insert(op.to_string(), message.to_string());
    }

    pub fn allocate_calls(&self) -> usize {
        self.state.lock().unwrap().allocate_calls
    }

    pub fn released(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().released.clone()
    }
}

#[async_trait]
impl IpAllocator for MockAllocator {
    async fn allocate(&self, instance_name: &str, subnet: Ipv4Network, client_id: &str) -> Result<Ipv4Addr> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.state.lock().unwrap();
        s.allocate_calls += 1;
        if let Some(msg) = s.fail_on.get("allocate") {
            return Err(Error::collaborator("IP allocator", msg.clone()));
        }

        let offset = u32::try_from(s.leases.len()).unwrap() + 2;
        let ip = Ipv4Addr::from(u32::from(subnet.network()) + offset);
        s.leases
            .insert((instance_name.to_string(), client_id.to_string()), ip);
        Ok(ip)
    }

    async fn release(&self, instance_name: &str, client_id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(msg) = s.fail_on.get("release") {
            return Err(Error::collaborator("IP allocator", msg.clone()));
        }
        s.leases
            .remove(&(instance_name.to_string(), client_id.to_string()));
        s.released
            .push((instance_name.to_string(), client_id.to_string()));
        Ok(())
    }
}

// ============================================================================
// MockDriver
// ============================================================================

#[derive(Debug, Default)]
pub struct DriverState {
    /// Last machine rule list applied
    pub machine_rules: Vec<MachineRule>,
    pub machine_applies: usize,
    /// Last policy applied per instance
    pub policies: HashMap<String, InstancePolicy>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockDriver {
    pub state: Arc<Mutex<DriverState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .insert(op.to_string(), message.to_string());
    }

    pub fn recover(&self) {
        self.state.lock().unwrap().fail_on.clear();
    }

    pub fn applied_machine_rules(&self) -> Vec<MachineRule> {
        self.state.lock().unwrap().machine_rules.clone()
    }

    pub fn policy(&self, instance_id: &str) -> Option<InstancePolicy> {
        self.state.lock().unwrap().policies.get(instance_id).cloned()
    }
}

#[async_trait]
impl EnforcementDriver for MockDriver {
    async fn apply_machine_rules(&self, rules: &[MachineRule]) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(msg) = s.fail_on.get("apply_machine_rules") {
            return Err(Error::collaborator("Enforcement driver", msg.clone()));
        }
        s.machine_rules = rules.to_vec();
        s.machine_applies += 1;
        Ok(())
    }

    async fn apply_instance_policy(&self, policy: &InstancePolicy) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(msg) = s.fail_on.get("apply_instance_policy") {
            return Err(Error::collaborator("Enforcement driver", msg.clone()));
        }
        s.policies
            .insert(policy.instance.id.clone(), policy.clone());
        Ok(())
    }
}
