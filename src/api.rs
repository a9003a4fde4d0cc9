//! Transport-agnostic command surface
//!
//! A [`Request`] is a JSON object tagged by `action`:
//!
//! ```json
//! { "action": "create_group", "name": "Developers", "instance_id": "office" }
//! ```
//!
//! [`dispatch`] runs it against a [`PolicyEngine`] and always answers with a
//! [`Response`] of the form `{ "success": bool, "body": ... }`. On failure the
//! body carries `detail`, `category`, `retryable` and `suggestions`. A failed
//! `resolve` also carries the fail-closed `resolution` (verdict `DROP`).

use crate::core::engine::PolicyEngine;
use crate::core::error::{Error, Result};
use crate::core::group::SubnetInfo;
use crate::core::instance::{DefaultPolicy, Instance, RouteDraft, TunnelMode};
use crate::core::machine::{ChainBucket, MachineRuleDraft};
use crate::core::resolver::{Flow, Resolution};
use crate::core::rule::RuleDraft;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "action", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Request {
    RegisterInstance {
        instance: Instance,
    },
    DeleteInstance {
        instance_id: String,
    },
    GetInstance {
        instance_id: String,
    },
    GetInstances,
    UpdateInstanceFirewallPolicy {
        instance_id: String,
        default_policy: DefaultPolicy,
    },
    UpdateInstanceRoutes {
        instance_id: String,
        tunnel_mode: TunnelMode,
        #[serde(default)]
        routes: Vec<RouteDraft>,
        #[serde(default)]
        dns_servers: Vec<String>,
    },
    ReapplyInstancePolicy {
        instance_id: String,
    },

    CreateGroup {
        name: String,
        instance_id: String,
        #[serde(default)]
        description: String,
    },
    DeleteGroup {
        group_id: String,
    },
    GetGroup {
        group_id: String,
    },
    GetGroups {
        #[serde(default)]
        instance_id: Option<String>,
    },
    AddGroupMember {
        group_id: String,
        client_id: String,
        subnet_info: SubnetInfo,
    },
    RemoveGroupMember {
        group_id: String,
        client_id: String,
        instance_name: String,
    },
    RemoveClientFromAllGroups {
        instance_id: String,
        client_id: String,
    },

    CreateRule {
        group_id: String,
        rule: RuleDraft,
    },
    UpdateRule {
        rule_id: Uuid,
        rule: RuleDraft,
    },
    DeleteRule {
        rule_id: Uuid,
    },
    ReorderRules {
        group_id: String,
        rule_ids: Vec<Uuid>,
    },
    GetRules {
        group_id: String,
    },
    PreviewGroupRules {
        group_id: String,
    },

    AddMachineRule {
        rule: MachineRuleDraft,
    },
    UpdateMachineRule {
        rule_id: Uuid,
        rule: MachineRuleDraft,
    },
    DeleteMachineRule {
        rule_id: Uuid,
    },
    ReorderMachineRules {
        rule_ids: Vec<Uuid>,
    },
    ReorderMachineBucket {
        bucket: ChainBucket,
        rule_ids: Vec<Uuid>,
    },
    ApplyMachineRules,
    GetMachineRules,
    GetMachineRuleBuckets,
    PreviewMachineRules,

    Resolve {
        instance_id: String,
        client_id: String,
        flow: Flow,
    },
    CheckIntegrity,
}

impl Request {
    /// Parses a request document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed JSON or an unknown action.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::validation("request", e.to_string()))
    }

    pub fn action(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub success: bool,
    pub body: Value,
}

impl Response {
    pub fn failure(err: &Error) -> Self {
        let translation = err.translate();
        Self {
            success: false,
            body: json!({
                "detail": translation.user_message,
                "category": err.category().as_ref(),
                "retryable": err.is_retryable(),
                "suggestions": translation.suggestions,
            }),
        }
    }
}

/// Failed request, with the verdict the flow is held to if it was a resolution
struct Failure {
    error: Error,
    resolution: Option<Resolution>,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            error,
            resolution: None,
        }
    }
}

impl Failure {
    fn into_response(self) -> Response {
        let mut response = Response::failure(&self.error);
        if let Some(resolution) = self.resolution
            && let Value::Object(ref mut body) = response.body
            && let Ok(value) = serde_json::to_value(resolution)
        {
            body.insert("resolution".to_string(), value);
        }
        response
    }
}

fn to_body<T: Serialize>(value: T) -> std::result::Result<Value, Failure> {
    serde_json::to_value(value).map_err(|e| Failure::from(Error::from(e)))
}

/// Runs `request` against `engine`.
pub async fn dispatch(engine: &PolicyEngine, request: Request) -> Response {
    let action = request.action();
    tracing::debug!("Dispatching {}", action);

    match execute(engine, request).await {
        Ok(body) => Response {
            success: true,
            body,
        },
        Err(failure) => {
            tracing::warn!("{} failed: {}", action, failure.error);
            failure.into_response()
        }
    }
}

/// Parses and runs a JSON request document.
pub async fn dispatch_json(engine: &PolicyEngine, json: &str) -> Response {
    match Request::from_json(json) {
        Ok(request) => dispatch(engine, request).await,
        Err(err) => {
            tracing::warn!("Rejected request: {}", err);
            Response::failure(&err)
        }
    }
}

async fn execute(engine: &PolicyEngine, request: Request) -> std::result::Result<Value, Failure> {
    match request {
        Request::RegisterInstance { instance } => to_body(engine.register_instance(instance).await?),
        Request::DeleteInstance { instance_id } => to_body(engine.delete_instance(&instance_id).await?),
        Request::GetInstance { instance_id } => to_body(engine.get_instance(&instance_id).await?),
        Request::GetInstances => to_body(engine.get_instances().await?),
        Request::UpdateInstanceFirewallPolicy {
            instance_id,
            default_policy,
        } => to_body(
            engine
                .update_instance_firewall_policy(&instance_id, default_policy)
                .await?,
        ),
        Request::UpdateInstanceRoutes {
            instance_id,
            tunnel_mode,
            routes,
            dns_servers,
        } => to_body(
            engine
                .update_instance_routes(&instance_id, tunnel_mode, &routes, &dns_servers)
                .await?,
        ),
        Request::ReapplyInstancePolicy { instance_id } => {
            engine.reapply_instance_policy(&instance_id).await?;
            Ok(json!({ "message": format!("policy of {instance_id} reapplied") }))
        }

        Request::CreateGroup {
            name,
            instance_id,
            description,
        } => to_body(engine.create_group(&name, &instance_id, &description).await?),
        Request::DeleteGroup { group_id } => to_body(engine.delete_group(&group_id).await?),
        Request::GetGroup { group_id } => to_body(engine.get_group(&group_id).await?),
        Request::GetGroups { instance_id } => to_body(engine.get_groups(instance_id.as_deref()).await?),
        Request::AddGroupMember {
            group_id,
            client_id,
            subnet_info,
        } => to_body(
            engine
                .add_group_member(&group_id, &client_id, subnet_info)
                .await?,
        ),
        Request::RemoveGroupMember {
            group_id,
            client_id,
            instance_name,
        } => to_body(
            engine
                .remove_group_member(&group_id, &client_id, &instance_name)
                .await?,
        ),
        Request::RemoveClientFromAllGroups {
            instance_id,
            client_id,
        } => {
            let group = engine
                .remove_client_from_all_groups(&instance_id, &client_id)
                .await?;
            Ok(json!({ "group_id": group }))
        }

        Request::CreateRule { group_id, rule } => to_body(engine.create_rule(&group_id, &rule).await?),
        Request::UpdateRule { rule_id, rule } => to_body(engine.update_rule(rule_id, &rule).await?),
        Request::DeleteRule { rule_id } => to_body(engine.delete_rule(rule_id).await?),
        Request::ReorderRules { group_id, rule_ids } => {
            to_body(engine.reorder_rules(&group_id, &rule_ids).await?)
        }
        Request::GetRules { group_id } => to_body(engine.get_rules(&group_id).await?),
        Request::PreviewGroupRules { group_id } => {
            to_body(engine.preview_group_rules(&group_id).await?)
        }

        Request::AddMachineRule { rule } => to_body(engine.add_machine_rule(&rule).await?),
        Request::UpdateMachineRule { rule_id, rule } => {
            to_body(engine.update_machine_rule(rule_id, &rule).await?)
        }
        Request::DeleteMachineRule { rule_id } => to_body(engine.delete_machine_rule(rule_id).await?),
        Request::ReorderMachineRules { rule_ids } => {
            to_body(engine.reorder_machine_rules(&rule_ids).await?)
        }
        Request::ReorderMachineBucket { bucket, rule_ids } => {
            to_body(engine.reorder_machine_bucket(bucket, &rule_ids).await?)
        }
        Request::ApplyMachineRules => {
            let count = engine.apply_machine_rules().await?;
            Ok(json!({ "message": format!("{count} machine rules applied") }))
        }
        Request::GetMachineRules => to_body(engine.get_machine_rules().await?),
        Request::GetMachineRuleBuckets => to_body(engine.machine_rule_buckets().await?),
        Request::PreviewMachineRules => to_body(engine.preview_machine_rules().await?),

        Request::Resolve {
            instance_id,
            client_id,
            flow,
        } => match engine.resolve_or_drop(&instance_id, &client_id, &flow).await {
            (resolution, None) => to_body(resolution),
            (resolution, Some(error)) => Err(Failure {
                error,
                resolution: Some(resolution),
            }),
        },
        Request::CheckIntegrity => to_body(engine.check_integrity().await?),
    }
}
