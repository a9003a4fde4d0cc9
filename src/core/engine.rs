//! Policy engine
//!
//! [`PolicyEngine`] owns the policy state and exposes every operation of the
//! command surface. State is split into independently locked scopes:
//!
//! - the instance table,
//! - one scope per group (the group and its ordered rules),
//! - the global machine rule list.
//!
//! Every lock acquisition is bounded by `lock_timeout` and reports
//! [`Error::Busy`] on expiry. Mutations run on a copy of the scope. The copy
//! is written to the store first and swapped in only once the write
//! succeeded, so a failed operation leaves both memory and store as they
//! were. Collaborator calls are bounded by `collaborator_timeout`; a failure
//! after the commit is reported as [`Error::Committed`].
//!
//! Lock order, outermost first: instance membership, instances, group map,
//! group scope, machine rules, committed state. No code path acquires an
//! outer lock while holding an inner one.

use crate::audit::{AuditLog, EventType};
use crate::config::AppConfig;
use crate::core::collaborators::{
    ALLOCATOR, DRIVER, EnforcementDriver, GroupPolicy, InstancePolicy, IpAllocator,
};
use crate::core::error::{ConflictKind, Error, Result};
use crate::core::group::{Group, Member, SubnetInfo};
use crate::core::instance::{
    DefaultPolicy, Instance, RouteDraft, TunnelMode, validate_network_settings,
};
use crate::core::machine::{ChainBucket, MachineRule, MachineRuleDraft, bucketize};
use crate::core::ordering::{self, check_dense, sort_by_order};
use crate::core::resolver::{self, Flow, GroupView, Resolution};
use crate::core::rule::{Rule, RuleDraft};
use crate::core::store::{self, Snapshot};
use crate::validators;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

const MACHINE_SCOPE: &str = "machine rules";
const STORE_SCOPE: &str = "policy store";

/// Tunables of a [`PolicyEngine`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub lock_timeout: Duration,
    pub collaborator_timeout: Duration,
    pub strict_port_validation: bool,
    pub max_rules_per_scope: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for EngineOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            collaborator_timeout: config.collaborator_timeout(),
            strict_port_validation: config.strict_port_validation,
            max_rules_per_scope: config.max_rules_per_scope,
        }
    }
}

#[derive(Debug, Clone)]
struct GroupScope {
    group: Group,
    rules: Vec<Rule>,
    /// Set when the group is removed; holders of a stale entry see `NotFound`.
    deleted: bool,
}

impl GroupScope {
    fn new(group: Group, rules: Vec<Rule>) -> Self {
        Self {
            group,
            rules,
            deleted: false,
        }
    }
}

/// Last committed state; every store write is built from it.
#[derive(Debug, Clone, Default)]
struct Committed {
    instances: BTreeMap<String, Instance>,
    groups: BTreeMap<String, GroupScope>,
    machine_rules: Vec<MachineRule>,
}

impl Committed {
    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            instances: self.instances.values().cloned().collect(),
            groups: self.groups.values().map(|s| s.group.clone()).collect(),
            rules: self
                .groups
                .values()
                .flat_map(|s| s.rules.iter().cloned())
                .collect(),
            machine_rules: self.machine_rules.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct GroupEntry {
    instance_id: String,
    scope: Arc<RwLock<GroupScope>>,
}

/// Result of an integrity check on one scope
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScopeReport {
    pub scope: String,
    pub rule_count: usize,
    /// `None` when the scope's order is dense
    pub problem: Option<String>,
}

fn group_scope_name(group_id: &str) -> String {
    format!("group {group_id}")
}

fn sorted_rules(rules: &[Rule]) -> Vec<Rule> {
    let mut rules = rules.to_vec();
    sort_by_order(&mut rules);
    rules
}

pub struct PolicyEngine {
    options: EngineOptions,
    allocator: Arc<dyn IpAllocator>,
    driver: Arc<dyn EnforcementDriver>,
    membership: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    instances: RwLock<BTreeMap<String, Instance>>,
    groups: RwLock<BTreeMap<String, GroupEntry>>,
    machine: RwLock<Vec<MachineRule>>,
    store_path: Option<PathBuf>,
    committed: Mutex<Committed>,
    audit: Option<AuditLog>,
}

impl PolicyEngine {
    /// Creates an empty engine without persistence or audit trail.
    pub fn new(
        allocator: Arc<dyn IpAllocator>,
        driver: Arc<dyn EnforcementDriver>,
        options: EngineOptions,
    ) -> Self {
        Self::from_snapshot(Snapshot::default(), allocator, driver, options)
    }

    /// Creates an engine holding `snapshot`.
    ///
    /// Rules are sorted by order; duplicate order values are kept so that
    /// resolution can detect them.
    pub fn from_snapshot(
        snapshot: Snapshot,
        allocator: Arc<dyn IpAllocator>,
        driver: Arc<dyn EnforcementDriver>,
        options: EngineOptions,
    ) -> Self {
        let mut rules_by_group: HashMap<String, Vec<Rule>> = HashMap::new();
        for rule in snapshot.rules {
            rules_by_group
                .entry(rule.group_id.clone())
                .or_default()
                .push(rule);
        }

        let scopes: BTreeMap<String, GroupScope> = snapshot
            .groups
            .into_iter()
            .map(|group| {
                let mut rules = rules_by_group.remove(&group.id).unwrap_or_default();
                sort_by_order(&mut rules);
                (group.id.clone(), GroupScope::new(group, rules))
            })
            .collect();

        let groups = scopes
            .iter()
            .map(|(id, scope)| {
                let entry = GroupEntry {
                    instance_id: scope.group.instance_id.clone(),
                    scope: Arc::new(RwLock::new(scope.clone())),
                };
                (id.clone(), entry)
            })
            .collect();

        let instances: BTreeMap<String, Instance> = snapshot
            .instances
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        let mut machine_rules = snapshot.machine_rules;
        sort_by_order(&mut machine_rules);

        let committed = Committed {
            instances: instances.clone(),
            groups: scopes,
            machine_rules: machine_rules.clone(),
        };

        Self {
            options,
            allocator,
            driver,
            membership: Mutex::new(HashMap::new()),
            instances: RwLock::new(instances),
            groups: RwLock::new(groups),
            machine: RwLock::new(machine_rules),
            store_path: None,
            committed: Mutex::new(committed),
            audit: None,
        }
    }

    /// Loads the store at `path` (if present) and persists every commit there.
    ///
    /// # Errors
    ///
    /// Returns a store error if the file exists but cannot be trusted.
    pub async fn open(
        path: &Path,
        allocator: Arc<dyn IpAllocator>,
        driver: Arc<dyn EnforcementDriver>,
        options: EngineOptions,
    ) -> Result<Self> {
        let snapshot = store::load(path).await?.unwrap_or_default();
        Ok(Self::from_snapshot(snapshot, allocator, driver, options).with_store(path))
    }

    #[must_use]
    pub fn with_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Locking, collaborators, persistence
    // ═══════════════════════════════════════════════════════════════════════

    fn busy(&self, scope: &str) -> Error {
        tracing::warn!(
            "Lock on {} not acquired within {} ms",
            scope,
            self.options.lock_timeout.as_millis()
        );
        Error::Busy {
            scope: scope.to_string(),
        }
    }

    async fn read<'a, T>(&self, lock: &'a RwLock<T>, scope: &str) -> Result<RwLockReadGuard<'a, T>> {
        tokio::time::timeout(self.options.lock_timeout, lock.read())
            .await
            .map_err(|_| self.busy(scope))
    }

    async fn write<'a, T>(&self, lock: &'a RwLock<T>, scope: &str) -> Result<RwLockWriteGuard<'a, T>> {
        tokio::time::timeout(self.options.lock_timeout, lock.write())
            .await
            .map_err(|_| self.busy(scope))
    }

    /// Serializes membership changes within one instance.
    async fn lock_membership(&self, instance_id: &str) -> Result<OwnedMutexGuard<()>> {
        let scope = format!("instance {instance_id} membership");
        let lock = {
            let mut locks = tokio::time::timeout(self.options.lock_timeout, self.membership.lock())
                .await
                .map_err(|_| self.busy(&scope))?;
            locks.entry(instance_id.to_string()).or_default().clone()
        };
        tokio::time::timeout(self.options.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| self.busy(&scope))
    }

    /// Runs a collaborator call under the collaborator timeout.
    async fn call<T>(&self, collaborator: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.options.collaborator_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err @ Error::CollaboratorUnavailable { .. })) => Err(err),
            Ok(Err(err)) => Err(Error::collaborator(collaborator, err.to_string())),
            Err(_) => Err(Error::collaborator(
                collaborator,
                format!(
                    "no answer within {} ms",
                    self.options.collaborator_timeout.as_millis()
                ),
            )),
        }
    }

    async fn record(&self, event: EventType, details: serde_json::Value) {
        if let Some(ref audit) = self.audit {
            audit.record(event, true, details, None).await;
        }
    }

    async fn record_failure(&self, event: EventType, details: serde_json::Value, error: &Error) {
        if let Some(ref audit) = self.audit {
            audit
                .record(event, false, details, Some(error.to_string()))
                .await;
        }
    }

    async fn lock_committed(&self) -> Result<tokio::sync::MutexGuard<'_, Committed>> {
        tokio::time::timeout(self.options.lock_timeout, self.committed.lock())
            .await
            .map_err(|_| self.busy(STORE_SCOPE))
    }

    /// Applies `stage` to the committed state and writes it to the store.
    ///
    /// Callers hold the write locks of the scopes `stage` touches and swap
    /// in their staged copies only after this returns `Ok`. Other scopes are
    /// not locked.
    async fn persist(&self, stage: impl FnOnce(&mut Committed)) -> Result<()> {
        let mut committed = self.lock_committed().await?;
        let mut next = committed.clone();
        stage(&mut next);
        if let Some(ref path) = self.store_path {
            store::save(path, &next.to_snapshot())
                .await
                .inspect_err(|e| tracing::error!("Failed to persist policy store: {}", e))?;
        }
        *committed = next;
        Ok(())
    }

    /// Persists `staged` as the new state of `group_id` and swaps it in.
    async fn commit_scope(&self, group_id: &str, scope: &mut GroupScope, staged: GroupScope) -> Result<()> {
        self.persist(|state| {
            state.groups.insert(group_id.to_string(), staged.clone());
        })
        .await?;
        *scope = staged;
        Ok(())
    }

    /// Consistent copy of the whole committed policy state.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a store write outlasts the lock timeout.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.lock_committed().await?.to_snapshot())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookups
    // ═══════════════════════════════════════════════════════════════════════

    async fn group_entry(&self, group_id: &str) -> Result<GroupEntry> {
        self.read(&self.groups, "groups")
            .await?
            .get(group_id)
            .cloned()
            .ok_or_else(|| Error::not_found("group", group_id))
    }

    async fn read_scope<'a>(&self, entry: &'a GroupEntry, group_id: &str) -> Result<RwLockReadGuard<'a, GroupScope>> {
        let scope = self.read(&entry.scope, &group_scope_name(group_id)).await?;
        if scope.deleted {
            return Err(Error::not_found("group", group_id));
        }
        Ok(scope)
    }

    /// Write-locks a group scope obtained from an earlier lookup.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the group was deleted since the lookup.
    async fn write_scope<'a>(&self, entry: &'a GroupEntry, group_id: &str) -> Result<RwLockWriteGuard<'a, GroupScope>> {
        let scope = self.write(&entry.scope, &group_scope_name(group_id)).await?;
        if scope.deleted {
            tracing::debug!("Group {} was deleted while waiting for its lock", group_id);
            return Err(Error::not_found("group", group_id));
        }
        Ok(scope)
    }

    async fn instance_entries(&self, instance_id: &str) -> Result<Vec<(String, GroupEntry)>> {
        Ok(self
            .read(&self.groups, "groups")
            .await?
            .iter()
            .filter(|(_, entry)| entry.instance_id == instance_id)
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect())
    }

    /// Returns the group of `instance_id` that holds `client_id`, if any.
    async fn find_client_group(&self, instance_id: &str, client_id: &str) -> Result<Option<String>> {
        for (id, entry) in self.instance_entries(instance_id).await? {
            let scope = self.read(&entry.scope, &group_scope_name(&id)).await?;
            if scope.deleted {
                continue;
            }
            if scope.group.has_member(client_id) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Returns the group that owns `rule_id`.
    async fn rule_owner(&self, rule_id: Uuid) -> Result<(String, GroupEntry)> {
        let entries: Vec<(String, GroupEntry)> = self
            .read(&self.groups, "groups")
            .await?
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        for (id, entry) in entries {
            let scope = self.read(&entry.scope, &group_scope_name(&id)).await?;
            if scope.deleted {
                continue;
            }
            if scope.rules.iter().any(|r| r.id == rule_id) {
                drop(scope);
                return Ok((id, entry));
            }
        }
        Err(Error::not_found("rule", rule_id))
    }

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown instance.
    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        self.read(&self.instances, "instances")
            .await?
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", instance_id))
    }

    pub async fn get_instances(&self) -> Result<Vec<Instance>> {
        Ok(self
            .read(&self.instances, "instances")
            .await?
            .values()
            .cloned()
            .collect())
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Group> {
        let entry = self.group_entry(group_id).await?;
        let scope = self.read_scope(&entry, group_id).await?;
        Ok(scope.group.clone())
    }

    /// Lists groups, optionally only those of one instance.
    pub async fn get_groups(&self, instance_id: Option<&str>) -> Result<Vec<Group>> {
        let entries: Vec<(String, GroupEntry)> = self
            .read(&self.groups, "groups")
            .await?
            .iter()
            .filter(|(_, e)| instance_id.is_none_or(|id| e.instance_id == id))
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        let mut groups = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            let scope = self.read(&entry.scope, &group_scope_name(&id)).await?;
            if scope.deleted {
                continue;
            }
            groups.push(scope.group.clone());
        }
        Ok(groups)
    }

    /// Returns the group's rules in ascending order.
    pub async fn get_rules(&self, group_id: &str) -> Result<Vec<Rule>> {
        let entry = self.group_entry(group_id).await?;
        let scope = self.read_scope(&entry, group_id).await?;
        Ok(sorted_rules(&scope.rules))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Instances
    // ═══════════════════════════════════════════════════════════════════════

    /// Adds or replaces an instance handed over by the instance manager.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an inconsistent instance, or `Committed` if
    /// enforcement fails after commit.
    pub async fn register_instance(&self, instance: Instance) -> Result<Instance> {
        instance.validate()?;
        {
            let mut instances = self.write(&self.instances, "instances").await?;
            self.persist(|state| {
                state.instances.insert(instance.id.clone(), instance.clone());
            })
            .await?;
            if instances
                .insert(instance.id.clone(), instance.clone())
                .is_some()
            {
                tracing::info!("Updated instance {}", instance.id);
            } else {
                tracing::info!("Registered instance {}", instance.id);
            }
        }
        self.record(
            EventType::RegisterInstance,
            json!({ "instance_id": instance.id }),
        )
        .await;
        self.enforce_committed(&instance.id).await?;
        Ok(instance)
    }

    /// Removes an instance with all of its groups and rules.
    ///
    /// Every member's static address is released after the commit.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<Instance> {
        let _membership = self.lock_membership(instance_id).await?;

        let (instance, members, group_count) = {
            let mut instances = self.write(&self.instances, "instances").await?;
            let instance = instances
                .get(instance_id)
                .cloned()
                .ok_or_else(|| Error::not_found("instance", instance_id))?;
            let mut groups = self.write(&self.groups, "groups").await?;
            let entries: Vec<(String, GroupEntry)> = groups
                .iter()
                .filter(|(_, e)| e.instance_id == instance_id)
                .map(|(id, e)| (id.clone(), e.clone()))
                .collect();

            let mut scopes = Vec::with_capacity(entries.len());
            for (id, entry) in &entries {
                scopes.push(self.write(&entry.scope, &group_scope_name(id)).await?);
            }
            let members: Vec<Member> = scopes
                .iter()
                .flat_map(|scope| scope.group.members.iter().cloned())
                .collect();

            self.persist(|state| {
                state.instances.remove(instance_id);
                state
                    .groups
                    .retain(|_, scope| scope.group.instance_id != instance_id);
            })
            .await?;

            for scope in &mut scopes {
                scope.deleted = true;
            }
            drop(scopes);
            for (id, _) in &entries {
                groups.remove(id);
            }
            instances.remove(instance_id);
            (instance, members, entries.len())
        };

        tracing::info!(
            "Deleted instance {} with {} groups and {} members",
            instance_id,
            group_count,
            members.len()
        );
        self.record(
            EventType::DeleteInstance,
            json!({ "instance_id": instance_id, "groups": group_count, "members": members.len() }),
        )
        .await;
        self.release_members(&members).await?;
        Ok(instance)
    }

    /// Applies `change` to a copy of the instance and commits it.
    async fn commit_instance(&self, instance_id: &str, change: impl FnOnce(&mut Instance)) -> Result<Instance> {
        let mut instances = self.write(&self.instances, "instances").await?;
        let mut instance = instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", instance_id))?;
        change(&mut instance);
        self.persist(|state| {
            state.instances.insert(instance_id.to_string(), instance.clone());
        })
        .await?;
        instances.insert(instance_id.to_string(), instance.clone());
        Ok(instance)
    }

    /// Sets the instance's fallback verdict.
    pub async fn update_instance_firewall_policy(
        &self,
        instance_id: &str,
        policy: DefaultPolicy,
    ) -> Result<Instance> {
        let instance = self
            .commit_instance(instance_id, |instance| {
                instance.firewall_default_policy = policy;
            })
            .await?;
        tracing::info!("Instance {} default policy set to {}", instance_id, policy);
        self.record(
            EventType::UpdateInstancePolicy,
            json!({ "instance_id": instance_id, "policy": policy.to_string() }),
        )
        .await;
        self.enforce_committed(instance_id).await?;
        Ok(instance)
    }

    /// Replaces tunnel mode, routes and DNS servers of an instance.
    pub async fn update_instance_routes(
        &self,
        instance_id: &str,
        tunnel_mode: TunnelMode,
        routes: &[RouteDraft],
        dns_servers: &[String],
    ) -> Result<Instance> {
        let settings = validate_network_settings(tunnel_mode, routes, dns_servers)?;
        let instance = self
            .commit_instance(instance_id, |instance| {
                instance.tunnel_mode = settings.tunnel_mode;
                instance.routes = settings.routes;
                instance.dns_servers = settings.dns_servers;
            })
            .await?;
        tracing::info!(
            "Instance {} now {} tunnel with {} routes",
            instance_id,
            instance.tunnel_mode,
            instance.routes.len()
        );
        self.record(
            EventType::UpdateInstanceRoutes,
            json!({ "instance_id": instance_id, "tunnel_mode": instance.tunnel_mode.to_string() }),
        )
        .await;
        Ok(instance)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Groups and members
    // ═══════════════════════════════════════════════════════════════════════

    /// Creates an empty group with id `<instance_id>_<slug>`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a bad name, `NotFound` for an unknown
    /// instance, or `Conflict(GroupExists)`.
    pub async fn create_group(&self, name: &str, instance_id: &str, description: &str) -> Result<Group> {
        let name = validators::validate_name(name).map_err(|e| Error::validation("name", e))?;
        let group = Group {
            id: Group::make_id(instance_id, &name),
            name,
            description: validators::sanitize_comment(description),
            instance_id: instance_id.to_string(),
            members: Vec::new(),
            created_at: chrono::Utc::now(),
        };

        {
            let instances = self.read(&self.instances, "instances").await?;
            if !instances.contains_key(instance_id) {
                return Err(Error::not_found("instance", instance_id));
            }
            let mut groups = self.write(&self.groups, "groups").await?;
            if groups.contains_key(&group.id) {
                return Err(Error::conflict(
                    ConflictKind::GroupExists,
                    format!("group {} already exists", group.id),
                ));
            }
            let scope = GroupScope::new(group.clone(), Vec::new());
            self.persist(|state| {
                state.groups.insert(group.id.clone(), scope.clone());
            })
            .await?;
            groups.insert(
                group.id.clone(),
                GroupEntry {
                    instance_id: instance_id.to_string(),
                    scope: Arc::new(RwLock::new(scope)),
                },
            );
        }

        tracing::info!("Created group {}", group.id);
        self.record(
            EventType::CreateGroup,
            json!({ "group_id": group.id, "instance_id": instance_id }),
        )
        .await;
        Ok(group)
    }

    /// Deletes a group with its rules and releases every member's address.
    pub async fn delete_group(&self, group_id: &str) -> Result<Group> {
        let entry = self.group_entry(group_id).await?;
        let _membership = self.lock_membership(&entry.instance_id).await?;

        let (group, rule_count) = {
            let mut groups = self.write(&self.groups, "groups").await?;
            let entry = groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| Error::not_found("group", group_id))?;
            let mut scope = self.write_scope(&entry, group_id).await?;
            self.persist(|state| {
                state.groups.remove(group_id);
            })
            .await?;
            scope.deleted = true;
            let removed = (scope.group.clone(), scope.rules.len());
            drop(scope);
            groups.remove(group_id);
            removed
        };

        tracing::info!(
            "Deleted group {} ({} rules, {} members)",
            group_id,
            rule_count,
            group.members.len()
        );
        self.record(
            EventType::DeleteGroup,
            json!({ "group_id": group_id, "rules": rule_count, "members": group.members.len() }),
        )
        .await;

        let released = self.release_members(&group.members).await;
        let enforced = self.enforce_committed(&entry.instance_id).await;
        released.and(enforced)?;
        Ok(group)
    }

    /// Adds a client to a group after reserving its static address.
    ///
    /// The allocator is called without any scope lock held. If the client
    /// joined another group of the instance in the meantime, the reserved
    /// address is released again.
    ///
    /// # Errors
    ///
    /// Returns `Conflict(AlreadyMember)` without calling the allocator if the
    /// client already belongs to a group of the instance.
    pub async fn add_group_member(&self, group_id: &str, client_id: &str, subnet: SubnetInfo) -> Result<Member> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(Error::validation("client_id", "client identifier cannot be empty"));
        }
        let entry = self.group_entry(group_id).await?;
        let instance = self.get_instance(&entry.instance_id).await?;
        if subnet.instance_name != instance.name {
            return Err(Error::validation(
                "instance_name",
                format!(
                    "group {group_id} belongs to instance {}, not {}",
                    instance.name, subnet.instance_name
                ),
            ));
        }

        if let Some(holder) = self.find_client_group(&instance.id, client_id).await? {
            return Err(already_member(client_id, &holder));
        }

        let ip = self
            .call(
                ALLOCATOR,
                self.allocator
                    .allocate(&subnet.instance_name, subnet.subnet, client_id),
            )
            .await
            .inspect_err(|e| tracing::error!("Address allocation for {} failed: {}", client_id, e))?;

        let member = Member {
            client_id: client_id.to_string(),
            instance_id: instance.id.clone(),
            instance_name: subnet.instance_name.clone(),
            subnet: subnet.subnet,
            ip: Some(ip),
        };

        if let Err(err) = self.append_member(group_id, member.clone()).await {
            tracing::warn!(
                "Adding {} to {} failed after allocation, releasing {}: {}",
                client_id,
                group_id,
                ip,
                err
            );
            if let Err(release_err) = self
                .call(
                    ALLOCATOR,
                    self.allocator.release(&member.instance_name, client_id),
                )
                .await
            {
                tracing::error!(
                    "Could not release {} for {}: {}",
                    ip,
                    client_id,
                    release_err
                );
            }
            return Err(err);
        }

        tracing::info!("Added {} to {} with address {}", client_id, group_id, ip);
        self.record(
            EventType::AddGroupMember,
            json!({ "group_id": group_id, "client_id": client_id, "ip": ip.to_string() }),
        )
        .await;
        self.enforce_committed(&instance.id).await?;
        Ok(member)
    }

    /// Appends under the membership lock, re-checking the instance's groups.
    async fn append_member(&self, group_id: &str, member: Member) -> Result<()> {
        let _membership = self.lock_membership(&member.instance_id).await?;
        if let Some(holder) = self
            .find_client_group(&member.instance_id, &member.client_id)
            .await?
        {
            return Err(already_member(&member.client_id, &holder));
        }
        let entry = self.group_entry(group_id).await?;
        let mut scope = self.write_scope(&entry, group_id).await?;
        let mut staged = scope.clone();
        staged.group.members.push(member);
        self.commit_scope(group_id, &mut scope, staged).await
    }

    /// Removes a client from a group and releases its address.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `instance_name` is not the group's instance,
    /// `NotFound` if the client is not a member.
    pub async fn remove_group_member(&self, group_id: &str, client_id: &str, instance_name: &str) -> Result<Member> {
        let entry = self.group_entry(group_id).await?;
        let instance = self.get_instance(&entry.instance_id).await?;
        if instance.name != instance_name {
            return Err(Error::validation(
                "instance_name",
                format!(
                    "group {group_id} belongs to instance {}, not {instance_name}",
                    instance.name
                ),
            ));
        }
        self.detach_member(group_id, &entry, client_id).await
    }

    /// Removes a revoked client from whichever group of the instance holds it.
    ///
    /// Returns the group id it was removed from, or `None`.
    pub async fn remove_client_from_all_groups(
        &self,
        instance_id: &str,
        client_id: &str,
    ) -> Result<Option<String>> {
        self.get_instance(instance_id).await?;
        let Some(group_id) = self.find_client_group(instance_id, client_id).await? else {
            tracing::debug!("{} is not in any group of {}", client_id, instance_id);
            return Ok(None);
        };
        let entry = self.group_entry(&group_id).await?;
        self.detach_member(&group_id, &entry, client_id).await?;
        Ok(Some(group_id))
    }

    async fn detach_member(&self, group_id: &str, entry: &GroupEntry, client_id: &str) -> Result<Member> {
        let member = {
            let _membership = self.lock_membership(&entry.instance_id).await?;
            let mut scope = self.write_scope(entry, group_id).await?;
            let mut staged = scope.clone();
            let member = staged
                .group
                .take_member(client_id)
                .ok_or_else(|| Error::not_found("member", client_id))?;
            self.commit_scope(group_id, &mut scope, staged).await?;
            member
        };

        tracing::info!("Removed {} from {}", client_id, group_id);
        self.record(
            EventType::RemoveGroupMember,
            json!({ "group_id": group_id, "client_id": client_id }),
        )
        .await;

        let released = self.release_members(std::slice::from_ref(&member)).await;
        let enforced = self.enforce_committed(&entry.instance_id).await;
        released.and(enforced)?;
        Ok(member)
    }

    /// Releases one address per member of a committed removal.
    ///
    /// Failures are collected, not skipped, and reported as `Committed`.
    async fn release_members(&self, members: &[Member]) -> Result<()> {
        let mut failed = Vec::new();
        for member in members {
            if let Err(e) = self
                .call(
                    ALLOCATOR,
                    self.allocator
                        .release(&member.instance_name, &member.client_id),
                )
                .await
            {
                tracing::error!(
                    "Failed to release address of {} on {}: {}",
                    member.client_id,
                    member.instance_name,
                    e
                );
                failed.push(member.client_id.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::committed(
                ALLOCATOR,
                format!("addresses not released for: {}", failed.join(", ")),
            ))
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Group rules
    // ═══════════════════════════════════════════════════════════════════════

    fn check_capacity(&self, count: usize, scope: &str) -> Result<()> {
        if count >= self.options.max_rules_per_scope {
            return Err(Error::validation(
                "rules",
                format!(
                    "{scope} already holds {count} rules (max {})",
                    self.options.max_rules_per_scope
                ),
            ));
        }
        Ok(())
    }

    /// Adds a rule to a group, appended or at `draft.order`.
    pub async fn create_rule(&self, group_id: &str, draft: &RuleDraft) -> Result<Rule> {
        let fields = draft.validate(self.options.strict_port_validation)?;
        let entry = self.group_entry(group_id).await?;
        let scope_name = group_scope_name(group_id);

        let rule = {
            let mut scope = self.write_scope(&entry, group_id).await?;
            self.check_capacity(scope.rules.len(), &scope_name)?;

            let rule = Rule {
                id: Uuid::new_v4(),
                group_id: group_id.to_string(),
                order: 0,
                action: fields.action,
                protocol: fields.protocol,
                destination: fields.destination,
                port: fields.port,
                description: fields.description,
                created_at: chrono::Utc::now(),
            };
            let mut staged = scope.clone();
            let order = ordering::insert(&mut staged.rules, rule.clone(), draft.order, &scope_name)?;
            self.commit_scope(group_id, &mut scope, staged).await?;
            Rule { order, ..rule }
        };

        tracing::info!("Created rule {} in {} at {}", rule.id, group_id, rule.order);
        self.record(
            EventType::CreateRule,
            json!({ "group_id": group_id, "rule_id": rule.id, "order": rule.order }),
        )
        .await;
        self.enforce_committed(&entry.instance_id).await?;
        Ok(rule)
    }

    /// Replaces a rule's fields. Its order is left untouched.
    pub async fn update_rule(&self, rule_id: Uuid, draft: &RuleDraft) -> Result<Rule> {
        let fields = draft.validate(self.options.strict_port_validation)?;
        let (group_id, entry) = self.rule_owner(rule_id).await?;

        let rule = {
            let mut scope = self.write_scope(&entry, &group_id).await?;
            let mut staged = scope.clone();
            let rule = staged
                .rules
                .iter_mut()
                .find(|r| r.id == rule_id)
                .ok_or_else(|| Error::not_found("rule", rule_id))?;
            rule.apply_fields(fields);
            let rule = rule.clone();
            self.commit_scope(&group_id, &mut scope, staged).await?;
            rule
        };

        tracing::info!("Updated rule {} in {}", rule_id, group_id);
        self.record(
            EventType::UpdateRule,
            json!({ "group_id": group_id, "rule_id": rule_id }),
        )
        .await;
        self.enforce_committed(&entry.instance_id).await?;
        Ok(rule)
    }

    /// Deletes a rule and compacts the group's order.
    pub async fn delete_rule(&self, rule_id: Uuid) -> Result<Rule> {
        let (group_id, entry) = self.rule_owner(rule_id).await?;
        let scope_name = group_scope_name(&group_id);

        let removed = {
            let mut scope = self.write_scope(&entry, &group_id).await?;
            let mut staged = scope.clone();
            let removed = ordering::remove(&mut staged.rules, rule_id, "rule", &scope_name)?;
            self.commit_scope(&group_id, &mut scope, staged).await?;
            removed
        };

        tracing::info!("Deleted rule {} from {}", rule_id, group_id);
        self.record(
            EventType::DeleteRule,
            json!({ "group_id": group_id, "rule_id": rule_id }),
        )
        .await;
        self.enforce_committed(&entry.instance_id).await?;
        Ok(removed)
    }

    /// Reorders a group's rules to exactly `ids`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict(IncompleteSet)` unless `ids` is a permutation of the
    /// group's rule ids; the group is unchanged in that case.
    pub async fn reorder_rules(&self, group_id: &str, ids: &[Uuid]) -> Result<Vec<Rule>> {
        let entry = self.group_entry(group_id).await?;
        let scope_name = group_scope_name(group_id);

        let rules = {
            let mut scope = self.write_scope(&entry, group_id).await?;
            let mut staged = scope.clone();
            ordering::reorder(&mut staged.rules, ids, &scope_name).inspect_err(|e| {
                tracing::warn!("Rejected reorder of {}: {}", group_id, e);
            })?;
            let rules = staged.rules.clone();
            self.commit_scope(group_id, &mut scope, staged).await?;
            rules
        };

        tracing::info!("Reordered {} rules in {}", rules.len(), group_id);
        self.record(
            EventType::ReorderRules,
            json!({ "group_id": group_id, "rule_count": rules.len() }),
        )
        .await;
        self.enforce_committed(&entry.instance_id).await?;
        Ok(rules)
    }

    /// Advisory per-member command lines for a group's rules.
    pub async fn preview_group_rules(&self, group_id: &str) -> Result<Vec<String>> {
        let entry = self.group_entry(group_id).await?;
        let scope = self.read_scope(&entry, group_id).await?;
        let rules = sorted_rules(&scope.rules);
        Ok(scope
            .group
            .members
            .iter()
            .filter_map(|m| m.ip)
            .flat_map(|ip| rules.iter().map(move |r| r.preview_for_member(ip)))
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Machine rules
    // ═══════════════════════════════════════════════════════════════════════

    /// Applies `mutate` to a copy of the machine rules, hands the result to
    /// the driver and commits only if the driver accepted it.
    ///
    /// If the store write fails afterwards, the previous set is handed back
    /// to the driver and the rules stay unchanged.
    async fn commit_machine<T, F>(&self, event: EventType, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<MachineRule>) -> Result<T>,
    {
        let (value, count) = {
            let mut rules = self.write(&self.machine, MACHINE_SCOPE).await?;
            let mut next = rules.clone();
            let value = mutate(&mut next)?;

            if let Err(err) = self
                .call(DRIVER, self.driver.apply_machine_rules(&next))
                .await
            {
                tracing::error!("Machine rules not applied, keeping previous set: {}", err);
                self.record_failure(event, json!({ "rule_count": next.len() }), &err)
                    .await;
                return Err(err);
            }

            if let Err(err) = self
                .persist(|state| state.machine_rules.clone_from(&next))
                .await
            {
                tracing::warn!("Restoring previous {} machine rules", rules.len());
                if let Err(restore_err) = self
                    .call(DRIVER, self.driver.apply_machine_rules(&rules))
                    .await
                {
                    tracing::error!("Previous machine rules not restored: {}", restore_err);
                }
                self.record_failure(event, json!({ "rule_count": next.len() }), &err)
                    .await;
                return Err(err);
            }

            *rules = next;
            (value, rules.len())
        };

        self.record(event, json!({ "rule_count": count })).await;
        Ok(value)
    }

    pub async fn add_machine_rule(&self, draft: &MachineRuleDraft) -> Result<MachineRule> {
        let fields = draft.validate(self.options.strict_port_validation)?;
        let rule = self
            .commit_machine(EventType::AddMachineRule, |rules| {
                self.check_capacity(rules.len(), MACHINE_SCOPE)?;
                let rule = MachineRule::new(Uuid::new_v4(), 0, fields);
                let order = ordering::insert(rules, rule.clone(), draft.order, MACHINE_SCOPE)?;
                Ok(MachineRule { order, ..rule })
            })
            .await?;
        tracing::info!(
            "Added machine rule {} ({}/{}) at {}",
            rule.id,
            rule.table,
            rule.chain,
            rule.order
        );
        Ok(rule)
    }

    /// Replaces a machine rule's fields. Its order is left untouched.
    pub async fn update_machine_rule(&self, rule_id: Uuid, draft: &MachineRuleDraft) -> Result<MachineRule> {
        let fields = draft.validate(self.options.strict_port_validation)?;
        let rule = self
            .commit_machine(EventType::UpdateMachineRule, |rules| {
                let rule = rules
                    .iter_mut()
                    .find(|r| r.id == rule_id)
                    .ok_or_else(|| Error::not_found("machine rule", rule_id))?;
                rule.apply_fields(fields);
                Ok(rule.clone())
            })
            .await?;
        tracing::info!("Updated machine rule {}", rule_id);
        Ok(rule)
    }

    pub async fn delete_machine_rule(&self, rule_id: Uuid) -> Result<MachineRule> {
        let removed = self
            .commit_machine(EventType::DeleteMachineRule, |rules| {
                ordering::remove(rules, rule_id, "machine rule", MACHINE_SCOPE)
            })
            .await?;
        tracing::info!("Deleted machine rule {}", rule_id);
        Ok(removed)
    }

    /// Reorders the whole machine rule set; `ids` must list every rule.
    pub async fn reorder_machine_rules(&self, ids: &[Uuid]) -> Result<Vec<MachineRule>> {
        let rules = self
            .commit_machine(EventType::ReorderMachineRules, |rules| {
                ordering::reorder(rules, ids, MACHINE_SCOPE)?;
                Ok(rules.clone())
            })
            .await
            .inspect_err(|e| tracing::warn!("Rejected machine rule reorder: {}", e))?;
        tracing::info!("Reordered {} machine rules", rules.len());
        Ok(rules)
    }

    /// Reorders one display bucket inside the slots it already occupies.
    ///
    /// `ids` must list exactly the bucket's rules. Rules of other buckets
    /// keep their global positions.
    pub async fn reorder_machine_bucket(&self, bucket: ChainBucket, ids: &[Uuid]) -> Result<Vec<MachineRule>> {
        let scope = format!("{MACHINE_SCOPE} bucket {bucket}");
        let rules = self
            .commit_machine(EventType::ReorderMachineRules, |rules| {
                ordering::reorder_subset(rules, ids, |r| r.bucket() == bucket, &scope)?;
                Ok(rules.clone())
            })
            .await
            .inspect_err(|e| tracing::warn!("Rejected reorder of bucket {}: {}", bucket, e))?;
        tracing::info!("Reordered machine bucket {}", bucket);
        Ok(rules)
    }

    /// Hands the current machine rules to the driver again.
    pub async fn apply_machine_rules(&self) -> Result<usize> {
        self.commit_machine(EventType::ApplyMachineRules, |rules| Ok(rules.len()))
            .await
    }

    /// Machine rules in global order.
    pub async fn get_machine_rules(&self) -> Result<Vec<MachineRule>> {
        Ok(self.read(&self.machine, MACHINE_SCOPE).await?.clone())
    }

    pub async fn machine_rule_buckets(&self) -> Result<BTreeMap<ChainBucket, Vec<MachineRule>>> {
        Ok(bucketize(&self.read(&self.machine, MACHINE_SCOPE).await?))
    }

    pub async fn preview_machine_rules(&self) -> Result<Vec<String>> {
        Ok(self
            .read(&self.machine, MACHINE_SCOPE)
            .await?
            .iter()
            .map(MachineRule::preview)
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resolution and enforcement
    // ═══════════════════════════════════════════════════════════════════════

    /// Resolves a flow from `client_id` on `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown instance and `Corruption` if the
    /// client's group has duplicate order values. Corruption is logged and
    /// written to the audit trail.
    pub async fn resolve(&self, instance_id: &str, client_id: &str, flow: &Flow) -> Result<Resolution> {
        let default_policy = self.get_instance(instance_id).await?.firewall_default_policy;

        let mut outcome = None;
        for (id, entry) in self.instance_entries(instance_id).await? {
            let scope = self.read(&entry.scope, &group_scope_name(&id)).await?;
            if scope.deleted {
                continue;
            }
            if scope.group.has_member(client_id) {
                let view = GroupView {
                    group_id: &id,
                    rules: &scope.rules,
                };
                outcome = Some(resolver::resolve(flow, Some(view), default_policy));
                break;
            }
        }
        let outcome = outcome.unwrap_or_else(|| resolver::resolve(flow, None, default_policy));

        match outcome {
            Err(err @ Error::Corruption { .. }) => {
                tracing::error!(
                    "Refusing to resolve for {} on {}: {}",
                    client_id,
                    instance_id,
                    err
                );
                if let Some(ref audit) = self.audit {
                    audit
                        .record(
                            EventType::CorruptionDetected,
                            false,
                            json!({ "instance_id": instance_id, "client_id": client_id }),
                            Some(err.to_string()),
                        )
                        .await;
                }
                Err(err)
            }
            other => other,
        }
    }

    /// Like [`Self::resolve`], but always yields a verdict.
    ///
    /// Any failure is a DROP, returned together with the error behind it.
    pub async fn resolve_or_drop(
        &self,
        instance_id: &str,
        client_id: &str,
        flow: &Flow,
    ) -> (Resolution, Option<Error>) {
        match self.resolve(instance_id, client_id, flow).await {
            Ok(resolution) => (resolution, None),
            Err(err) => {
                tracing::warn!(
                    "Failing closed for {} on {}: {}",
                    client_id,
                    instance_id,
                    err
                );
                (Resolution::fail_closed(None), Some(err))
            }
        }
    }

    /// Builds the driver's view of one instance from the committed state.
    ///
    /// Scopes locked by writers in progress do not delay it.
    async fn instance_policy(&self, instance_id: &str) -> Result<InstancePolicy> {
        let committed = self.lock_committed().await?;
        let instance = committed
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", instance_id))?;
        let groups = committed
            .groups
            .iter()
            .filter(|(_, scope)| scope.group.instance_id == instance_id)
            .map(|(id, scope)| GroupPolicy {
                group_id: id.clone(),
                members: scope.group.members.clone(),
                rules: sorted_rules(&scope.rules),
            })
            .collect();
        Ok(InstancePolicy { instance, groups })
    }

    async fn enforce_instance(&self, instance_id: &str) -> Result<()> {
        let policy = self.instance_policy(instance_id).await?;
        match self
            .call(DRIVER, self.driver.apply_instance_policy(&policy))
            .await
        {
            Ok(()) => {
                tracing::debug!("Applied policy of instance {}", instance_id);
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    "Policy of instance {} committed but not applied: {}",
                    instance_id,
                    err
                );
                self.record_failure(
                    EventType::ApplyInstancePolicy,
                    json!({ "instance_id": instance_id }),
                    &err,
                )
                .await;
                Err(err)
            }
        }
    }

    /// Enforcement following a committed change.
    ///
    /// Any failure is reported as `Committed` so that callers do not submit
    /// the change again; `reapply_instance_policy` retries enforcement.
    async fn enforce_committed(&self, instance_id: &str) -> Result<()> {
        self.enforce_instance(instance_id)
            .await
            .map_err(|err| Error::committed(DRIVER, err.to_string()))
    }

    /// Hands an instance's committed policy to the driver again.
    pub async fn reapply_instance_policy(&self, instance_id: &str) -> Result<()> {
        self.enforce_instance(instance_id).await?;
        self.record(
            EventType::ApplyInstancePolicy,
            json!({ "instance_id": instance_id }),
        )
        .await;
        Ok(())
    }

    /// Checks the dense-order invariant of every scope.
    pub async fn check_integrity(&self) -> Result<Vec<ScopeReport>> {
        let mut reports = Vec::new();
        let entries: Vec<(String, GroupEntry)> = self
            .read(&self.groups, "groups")
            .await?
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        for (id, entry) in entries {
            let scope_name = group_scope_name(&id);
            let scope = self.read(&entry.scope, &scope_name).await?;
            if scope.deleted {
                continue;
            }
            reports.push(ScopeReport {
                problem: check_dense(&scope.rules).err().map(|v| format!("{v:?}")),
                rule_count: scope.rules.len(),
                scope: scope_name,
            });
        }

        let machine = self.read(&self.machine, MACHINE_SCOPE).await?;
        reports.push(ScopeReport {
            scope: MACHINE_SCOPE.to_string(),
            rule_count: machine.len(),
            problem: check_dense(&machine).err().map(|v| format!("{v:?}")),
        });
        Ok(reports)
    }
}

fn already_member(client_id: &str, group_id: &str) -> Error {
    Error::conflict(
        ConflictKind::AlreadyMember,
        format!("{client_id} is already a member of {group_id}"),
    )
}
