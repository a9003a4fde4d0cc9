//! Integration tests for vpnpolicy
//!
//! These tests drive the engine and the JSON command surface end to end,
//! with recording collaborators in place of the IP allocator and the
//! enforcement driver:
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use vpnpolicy::api::{self, Request};
use vpnpolicy::audit::{AuditLog, EventType};
use vpnpolicy::core::collaborators::{EnforcementDriver, InstancePolicy, IpAllocator};
use vpnpolicy::core::error::{ConflictKind, ErrorCategory, StoreError};
use vpnpolicy::core::group::{Member, SubnetInfo};
use vpnpolicy::core::instance::{DefaultPolicy, Instance, TunnelMode, VpnTransport};
use vpnpolicy::core::machine::{MachineRule, MachineRuleDraft};
use vpnpolicy::core::resolver::{Flow, Verdict, VerdictSource};
use vpnpolicy::core::rule::{Protocol, Rule, RuleDraft};
use vpnpolicy::core::store::{self, Snapshot};
use vpnpolicy::{EngineOptions, Error, PolicyEngine};

#[derive(Default)]
struct Calls {
    allocated: Vec<String>,
    released: Vec<String>,
    machine_applies: usize,
    policies: usize,
}

/// Allocator and driver in one, recording every call
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Calls>>,
}

impl Recorder {
    fn allocated(&self) -> Vec<String> {
        self.calls.lock().unwrap().allocated.clone()
    }

    fn released(&self) -> Vec<String> {
        self.calls.lock().unwrap().released.clone()
    }
}

#[async_trait]
impl IpAllocator for Recorder {
    async fn allocate(&self, _instance_name: &str, subnet: Ipv4Network, client_id: &str) -> vpnpolicy::Result<Ipv4Addr> {
        let mut calls = self.calls.lock().unwrap();
        calls.allocated.push(client_id.to_string());
        let offset = u32::try_from(calls.allocated.len()).unwrap() + 1;
        Ok(Ipv4Addr::from(u32::from(subnet.network()) + offset))
    }

    async fn release(&self, _instance_name: &str, client_id: &str) -> vpnpolicy::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .released
            .push(client_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl EnforcementDriver for Recorder {
    async fn apply_machine_rules(&self, _rules: &[MachineRule]) -> vpnpolicy::Result<()> {
        self.calls.lock().unwrap().machine_applies += 1;
        Ok(())
    }

    async fn apply_instance_policy(&self, _policy: &InstancePolicy) -> vpnpolicy::Result<()> {
        self.calls.lock().unwrap().policies += 1;
        Ok(())
    }
}

fn options() -> EngineOptions {
    EngineOptions {
        lock_timeout: Duration::from_millis(500),
        collaborator_timeout: Duration::from_millis(500),
        ..EngineOptions::default()
    }
}

fn engine() -> (PolicyEngine, Recorder) {
    let recorder = Recorder::default();
    let engine = PolicyEngine::new(
        Arc::new(recorder.clone()),
        Arc::new(recorder.clone()),
        options(),
    );
    (engine, recorder)
}

fn instance(id: &str, policy: DefaultPolicy) -> Instance {
    Instance {
        id: id.to_string(),
        name: id.to_string(),
        port: 1194,
        subnet: "10.8.0.0/24".parse().unwrap(),
        protocol: VpnTransport::Udp,
        tunnel_mode: TunnelMode::Full,
        routes: Vec::new(),
        dns_servers: Vec::new(),
        firewall_default_policy: policy,
    }
}

fn subnet(instance: &str) -> SubnetInfo {
    SubnetInfo {
        instance_name: instance.to_string(),
        subnet: "10.8.0.0/24".parse().unwrap(),
    }
}

fn draft(action: &str, protocol: &str, destination: &str, port: Option<&str>) -> RuleDraft {
    RuleDraft {
        action: action.to_string(),
        protocol: protocol.to_string(),
        destination: destination.to_string(),
        port: port.map(str::to_string),
        ..RuleDraft::default()
    }
}

fn flow(protocol: Protocol, destination: &str, port: Option<u16>) -> Flow {
    Flow {
        protocol,
        destination: destination.parse().unwrap(),
        port,
    }
}

/// Engine with instance `office` (given policy) and group `office_devs`.
async fn office(policy: DefaultPolicy) -> (PolicyEngine, Recorder, String) {
    let (engine, recorder) = engine();
    engine
        .register_instance(instance("office", policy))
        .await
        .unwrap();
    let group = engine.create_group("devs", "office", "").await.unwrap();
    (engine, recorder, group.id)
}

#[tokio::test]
async fn test_first_match_with_catch_all_drop() {
    let (engine, _, group) = office(DefaultPolicy::Accept).await;
    engine
        .add_group_member(&group, "alice", subnet("office"))
        .await
        .unwrap();
    engine
        .create_rule(&group, &draft("ACCEPT", "tcp", "any", Some("443")))
        .await
        .unwrap();
    engine
        .create_rule(&group, &draft("DROP", "all", "any", None))
        .await
        .unwrap();

    let https = engine
        .resolve("office", "alice", &flow(Protocol::Tcp, "93.184.216.34", Some(443)))
        .await
        .unwrap();
    assert_eq!(https.verdict, Verdict::Accept);

    let dns = engine
        .resolve("office", "alice", &flow(Protocol::Udp, "1.1.1.1", Some(53)))
        .await
        .unwrap();
    assert_eq!(dns.verdict, Verdict::Drop);
    assert_eq!(dns.source, VerdictSource::GroupRule);
}

#[tokio::test]
async fn test_client_without_group_gets_default_drop() {
    let (engine, _, _) = office(DefaultPolicy::Drop).await;
    for f in [
        flow(Protocol::Tcp, "10.0.0.1", Some(22)),
        flow(Protocol::Udp, "8.8.8.8", Some(53)),
        flow(Protocol::Icmp, "192.168.1.1", None),
    ] {
        let resolution = engine.resolve("office", "mallory", &f).await.unwrap();
        assert_eq!(resolution.verdict, Verdict::Drop);
        assert_eq!(resolution.source, VerdictSource::DefaultPolicy);
    }
}

#[tokio::test]
async fn test_icmp_rule_with_port_rejected() {
    let (engine, _, group) = office(DefaultPolicy::Drop).await;
    let err = engine
        .create_rule(&group, &draft("ACCEPT", "icmp", "any", Some("80")))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(engine.get_rules(&group).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_already_member_skips_allocator() {
    let (engine, recorder, devs) = office(DefaultPolicy::Drop).await;
    let ops = engine.create_group("ops", "office", "").await.unwrap();
    engine
        .add_group_member(&devs, "alice", subnet("office"))
        .await
        .unwrap();

    let err = engine
        .add_group_member(&ops.id, "alice", subnet("office"))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_kind(), Some(&ConflictKind::AlreadyMember));
    assert!(!err.is_retryable());
    assert_eq!(recorder.allocated(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_nat_chain_matrix() {
    let (engine, recorder) = engine();
    let nat = |chain: &str| MachineRuleDraft {
        table: Some("nat".to_string()),
        chain: chain.to_string(),
        action: "ACCEPT".to_string(),
        ..MachineRuleDraft::default()
    };

    let err = engine.add_machine_rule(&nat("INPUT")).await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(recorder.calls.lock().unwrap().machine_applies, 0);

    engine.add_machine_rule(&nat("PREROUTING")).await.unwrap();
    assert_eq!(recorder.calls.lock().unwrap().machine_applies, 1);
}

#[tokio::test]
async fn test_delete_group_releases_exactly_its_members() {
    let (engine, recorder, devs) = office(DefaultPolicy::Drop).await;
    let ops = engine.create_group("ops", "office", "").await.unwrap();
    for client in ["alice", "bob"] {
        engine
            .add_group_member(&devs, client, subnet("office"))
            .await
            .unwrap();
    }
    engine
        .add_group_member(&ops.id, "carol", subnet("office"))
        .await
        .unwrap();
    for port in ["22", "80"] {
        engine
            .create_rule(&devs, &draft("ACCEPT", "tcp", "any", Some(port)))
            .await
            .unwrap();
    }
    engine
        .create_rule(&ops.id, &draft("DROP", "all", "any", None))
        .await
        .unwrap();

    engine.delete_group(&devs).await.unwrap();

    let released: HashSet<String> = recorder.released().into_iter().collect();
    assert_eq!(recorder.released().len(), 2);
    assert_eq!(
        released,
        HashSet::from(["alice".to_string(), "bob".to_string()])
    );

    let snapshot = engine.snapshot().await.unwrap();
    assert!(snapshot.rules.iter().all(|r| r.group_id == ops.id));
    assert_eq!(snapshot.rules.len(), 1);
}

#[tokio::test]
async fn test_concurrent_creates_stay_dense() {
    let (engine, _, group) = office(DefaultPolicy::Drop).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for port in 1..=20u16 {
        let engine = Arc::clone(&engine);
        let group = group.clone();
        handles.push(tokio::spawn(async move {
            let port = port.to_string();
            engine
                .create_rule(&group, &draft("ACCEPT", "tcp", "any", Some(&port)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let orders: Vec<u32> = engine
        .get_rules(&group)
        .await
        .unwrap()
        .iter()
        .map(|r| r.order)
        .collect();
    assert_eq!(orders, (0..20).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    let recorder = Recorder::default();

    {
        let engine = PolicyEngine::open(
            &path,
            Arc::new(recorder.clone()),
            Arc::new(recorder.clone()),
            options(),
        )
        .await
        .unwrap();
        engine
            .register_instance(instance("office", DefaultPolicy::Drop))
            .await
            .unwrap();
        let group = engine.create_group("devs", "office", "").await.unwrap();
        engine
            .add_group_member(&group.id, "alice", subnet("office"))
            .await
            .unwrap();
        engine
            .create_rule(&group.id, &draft("ACCEPT", "tcp", "10.0.0.0/8", Some("22,80,443")))
            .await
            .unwrap();
        engine
            .add_machine_rule(&MachineRuleDraft {
                chain: "INPUT".to_string(),
                action: "ACCEPT".to_string(),
                protocol: Some("tcp".to_string()),
                port: Some("1194".to_string()),
                ..MachineRuleDraft::default()
            })
            .await
            .unwrap();
    }

    let reopened = PolicyEngine::open(
        &path,
        Arc::new(recorder.clone()),
        Arc::new(recorder.clone()),
        options(),
    )
    .await
    .unwrap();
    let rules = reopened.get_rules("office_devs").await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].port.as_ref().unwrap().to_string(), "22,80,443");
    assert_eq!(reopened.get_machine_rules().await.unwrap().len(), 1);

    let resolution = reopened
        .resolve("office", "alice", &flow(Protocol::Tcp, "10.1.1.1", Some(80)))
        .await
        .unwrap();
    assert_eq!(resolution.verdict, Verdict::Accept);
}

#[tokio::test]
async fn test_tampered_store_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    store::save(
        &path,
        &Snapshot {
            instances: vec![instance("office", DefaultPolicy::Drop)],
            ..Snapshot::default()
        },
    )
    .await
    .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("DROP", "ACCEPT")).unwrap();

    let recorder = Recorder::default();
    let result = PolicyEngine::open(
        &path,
        Arc::new(recorder.clone()),
        Arc::new(recorder),
        options(),
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::Store(StoreError::ChecksumMismatch { .. }))
    ));
}

fn duplicate_rule(group_id: &str, action: &str) -> Rule {
    let fields = draft(action, "all", "any", None).validate(true).unwrap();
    Rule {
        id: Uuid::new_v4(),
        group_id: group_id.to_string(),
        order: 0,
        action: fields.action,
        protocol: fields.protocol,
        destination: fields.destination,
        port: fields.port,
        description: fields.description,
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_corruption_fails_closed_and_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    let (seed, _) = engine();
    seed.register_instance(instance("office", DefaultPolicy::Accept))
        .await
        .unwrap();
    let group = seed.create_group("devs", "office", "").await.unwrap();
    let mut snapshot = seed.snapshot().await.unwrap();
    snapshot.groups[0].members.push(Member {
        client_id: "alice".to_string(),
        instance_id: "office".to_string(),
        instance_name: "office".to_string(),
        subnet: "10.8.0.0/24".parse().unwrap(),
        ip: Some("10.8.0.2".parse().unwrap()),
    });
    snapshot.rules = vec![
        duplicate_rule(&group.id, "ACCEPT"),
        duplicate_rule(&group.id, "DROP"),
    ];
    store::save(&path, &snapshot).await.unwrap();

    let recorder = Recorder::default();
    let audit = AuditLog::at(dir.path().join("audit.log"));
    let engine = PolicyEngine::open(
        &path,
        Arc::new(recorder.clone()),
        Arc::new(recorder),
        options(),
    )
    .await
    .unwrap()
    .with_audit(audit.clone());

    let f = flow(Protocol::Tcp, "10.0.0.1", Some(22));
    let err = engine.resolve("office", "alice", &f).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Corruption);
    assert_eq!(
        engine.resolve_or_drop("office", "alice", &f).await.0.verdict,
        Verdict::Drop
    );

    let response = api::dispatch(
        &engine,
        Request::Resolve {
            instance_id: "office".to_string(),
            client_id: "alice".to_string(),
            flow: f,
        },
    )
    .await;
    assert!(!response.success);
    assert_eq!(response.body["category"], "corruption");
    assert_eq!(response.body["resolution"]["verdict"], "DROP");
    assert_eq!(response.body["resolution"]["source"], "fail_closed");

    let events = audit.read_recent(10).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::CorruptionDetected && !e.success));
}

#[tokio::test]
async fn test_command_surface_round_trip() {
    let (engine, _) = engine();
    engine
        .register_instance(instance("office", DefaultPolicy::Drop))
        .await
        .unwrap();

    let created = api::dispatch_json(
        &engine,
        r#"{"action": "create_group", "name": "devs", "instance_id": "office", "description": "Developers"}"#,
    )
    .await;
    assert!(created.success, "{:?}", created.body);

    let mut ids = Vec::new();
    for port in ["22", "443"] {
        let response = api::dispatch(
            &engine,
            Request::CreateRule {
                group_id: "office_devs".to_string(),
                rule: draft("ACCEPT", "tcp", "any", Some(port)),
            },
        )
        .await;
        assert!(response.success);
        ids.push(response.body["id"].as_str().unwrap().to_string());
    }

    let stale = api::dispatch_json(
        &engine,
        &format!(
            r#"{{"action": "reorder_rules", "group_id": "office_devs", "rule_ids": ["{}"]}}"#,
            ids[1]
        ),
    )
    .await;
    assert!(!stale.success);
    assert_eq!(stale.body["category"], "conflict");
    assert_eq!(stale.body["retryable"], true);

    let reordered = api::dispatch_json(
        &engine,
        &format!(
            r#"{{"action": "reorder_rules", "group_id": "office_devs", "rule_ids": ["{}", "{}"]}}"#,
            ids[1], ids[0]
        ),
    )
    .await;
    assert!(reordered.success);
    assert_eq!(reordered.body[0]["id"], ids[1].as_str());
    assert_eq!(reordered.body[0]["order"], 0);

    let missing = api::dispatch_json(&engine, r#"{"action": "get_rules", "group_id": "nope"}"#).await;
    assert!(!missing.success);
    assert_eq!(missing.body["category"], "not_found");
}

#[tokio::test]
async fn test_split_tunnel_routes() {
    let (engine, recorder) = engine();
    engine
        .register_instance(instance("office", DefaultPolicy::Drop))
        .await
        .unwrap();

    let response = api::dispatch_json(
        &engine,
        r#"{"action": "update_instance_routes", "instance_id": "office", "tunnel_mode": "split",
            "routes": [{"network": "192.168.10.0/24", "interface": "eth1"}],
            "dns_servers": ["1.1.1.1"]}"#,
    )
    .await;
    assert!(response.success, "{:?}", response.body);

    let updated = engine.get_instance("office").await.unwrap();
    assert_eq!(updated.tunnel_mode, TunnelMode::Split);
    assert_eq!(updated.routes.len(), 1);
    assert!(updated.dns_servers.is_empty());
    assert!(recorder.calls.lock().unwrap().policies >= 1);
}
