//! Policy resolver
//!
//! Answers "what happens to this flow from this client": the first matching
//! rule of the client's group in ascending order wins, otherwise the
//! instance's default policy applies. Machine rules are enforced separately
//! and never take part here.
//!
//! Resolution fails closed: a scope with duplicate order values is reported
//! as corruption and callers must treat the flow as dropped.

use crate::core::error::{Error, Result};
use crate::core::instance::DefaultPolicy;
use crate::core::ordering::find_duplicate_order;
use crate::core::rule::{Action, Protocol, Rule};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Packet descriptor to resolve
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flow {
    pub protocol: Protocol,
    pub destination: Ipv4Addr,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Accept => Verdict::Accept,
            Action::Drop => Verdict::Drop,
            Action::Reject => Verdict::Reject,
        }
    }
}

impl From<DefaultPolicy> for Verdict {
    fn from(policy: DefaultPolicy) -> Self {
        match policy {
            DefaultPolicy::Accept => Verdict::Accept,
            DefaultPolicy::Drop => Verdict::Drop,
        }
    }
}

/// Where a verdict came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerdictSource {
    GroupRule,
    DefaultPolicy,
    /// Resolution failed and the flow is denied
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: Verdict,
    pub source: VerdictSource,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub matched_rule: Option<Uuid>,
}

impl Resolution {
    pub fn fail_closed(group_id: Option<String>) -> Self {
        Self {
            verdict: Verdict::Drop,
            source: VerdictSource::FailClosed,
            group_id,
            matched_rule: None,
        }
    }
}

/// Returns `true` if `rule` applies to `flow`.
///
/// A rule with a port never matches a flow without one.
pub fn rule_matches(rule: &Rule, flow: &Flow) -> bool {
    if !rule.protocol.covers(flow.protocol) {
        return false;
    }
    if !rule.destination.contains(flow.destination) {
        return false;
    }
    match (&rule.port, flow.port) {
        (None, _) => true,
        (Some(spec), Some(port)) => spec.contains(port),
        (Some(_), None) => false,
    }
}

/// The client's group and its rules, as seen at resolution time
#[derive(Debug, Clone, Copy)]
pub struct GroupView<'a> {
    pub group_id: &'a str,
    pub rules: &'a [Rule],
}

/// Resolves `flow` against the client's group (if any) and the default policy.
///
/// # Errors
///
/// Returns [`Error::Corruption`] if the group's rules contain duplicate
/// order values.
pub fn resolve(flow: &Flow, group: Option<GroupView<'_>>, default_policy: DefaultPolicy) -> Result<Resolution> {
    if let Some(view) = group {
        if let Some(order) = find_duplicate_order(view.rules) {
            return Err(Error::corruption(
                format!("group {}", view.group_id),
                format!("duplicate order {order}"),
            ));
        }

        let mut ordered: Vec<&Rule> = view.rules.iter().collect();
        ordered.sort_by_key(|r| r.order);

        if let Some(rule) = ordered.into_iter().find(|r| rule_matches(r, flow)) {
            return Ok(Resolution {
                verdict: rule.action.into(),
                source: VerdictSource::GroupRule,
                group_id: Some(view.group_id.to_string()),
                matched_rule: Some(rule.id),
            });
        }

        return Ok(Resolution {
            verdict: default_policy.into(),
            source: VerdictSource::DefaultPolicy,
            group_id: Some(view.group_id.to_string()),
            matched_rule: None,
        });
    }

    Ok(Resolution {
        verdict: default_policy.into(),
        source: VerdictSource::DefaultPolicy,
        group_id: None,
        matched_rule: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::make_rule;

    fn flow(protocol: Protocol, destination: [u8; 4], port: Option<u16>) -> Flow {
        Flow {
            protocol,
            destination: Ipv4Addr::from(destination),
            port,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            make_rule(0, "ACCEPT", "tcp", "any", Some("443")),
            make_rule(1, "DROP", "all", "any", None),
        ];
        let view = GroupView {
            group_id: "office_devs",
            rules: &rules,
        };

        let https = resolve(
            &flow(Protocol::Tcp, [1, 2, 3, 4], Some(443)),
            Some(view),
            DefaultPolicy::Accept,
        )
        .unwrap();
        assert_eq!(https.verdict, Verdict::Accept);
        assert_eq!(https.matched_rule, Some(rules[0].id));

        let dns = resolve(
            &flow(Protocol::Udp, [1, 2, 3, 4], Some(53)),
            Some(view),
            DefaultPolicy::Accept,
        )
        .unwrap();
        assert_eq!(dns.verdict, Verdict::Drop);
        assert_eq!(dns.matched_rule, Some(rules[1].id));
    }

    #[test]
    fn test_order_field_decides_not_vector_position() {
        let rules = vec![
            make_rule(1, "ACCEPT", "all", "any", None),
            make_rule(0, "REJECT", "icmp", "10.0.0.0/8", None),
        ];
        let view = GroupView {
            group_id: "g",
            rules: &rules,
        };
        let res = resolve(&flow(Protocol::Icmp, [10, 1, 1, 1], None), Some(view), DefaultPolicy::Drop)
            .unwrap();
        assert_eq!(res.verdict, Verdict::Reject);
    }

    #[test]
    fn test_no_group_uses_default_policy() {
        let res = resolve(&flow(Protocol::Tcp, [8, 8, 8, 8], Some(80)), None, DefaultPolicy::Drop).unwrap();
        assert_eq!(res.verdict, Verdict::Drop);
        assert_eq!(res.source, VerdictSource::DefaultPolicy);
    }

    #[test]
    fn test_no_match_falls_back() {
        let rules = vec![make_rule(0, "DROP", "tcp", "192.168.1.10", None)];
        let view = GroupView {
            group_id: "g",
            rules: &rules,
        };
        let res = resolve(&flow(Protocol::Tcp, [192, 168, 1, 11], None), Some(view), DefaultPolicy::Accept)
            .unwrap();
        assert_eq!(res.verdict, Verdict::Accept);
        assert_eq!(res.group_id.as_deref(), Some("g"));
    }

    #[test]
    fn test_port_rule_needs_flow_port() {
        let rule = make_rule(0, "ACCEPT", "tcp", "any", Some("1000:2000"));
        assert!(rule_matches(&rule, &flow(Protocol::Tcp, [1, 1, 1, 1], Some(1500))));
        assert!(!rule_matches(&rule, &flow(Protocol::Tcp, [1, 1, 1, 1], Some(2001))));
        assert!(!rule_matches(&rule, &flow(Protocol::Tcp, [1, 1, 1, 1], None)));
        assert!(!rule_matches(&rule, &flow(Protocol::Udp, [1, 1, 1, 1], Some(1500))));
    }

    #[test]
    fn test_duplicate_order_is_corruption() {
        let rules = vec![
            make_rule(0, "ACCEPT", "all", "any", None),
            make_rule(0, "DROP", "all", "any", None),
        ];
        let view = GroupView {
            group_id: "g",
            rules: &rules,
        };
        let err = resolve(&flow(Protocol::Tcp, [1, 1, 1, 1], None), Some(view), DefaultPolicy::Accept)
            .unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }
}
