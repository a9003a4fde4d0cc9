//! VPN client groups
//!
//! A [`Group`] belongs to exactly one instance and holds its members. Its
//! ordered rules are kept next to it by the engine (one lock per group).

use crate::validators;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Subnet context needed to request and release a member's static address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubnetInfo {
    pub instance_name: String,
    pub subnet: Ipv4Network,
}

/// Reference to a VPN client owned by the client subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub client_id: String,
    pub instance_id: String,
    pub instance_name: String,
    pub subnet: Ipv4Network,
    /// Static address handed out by the allocator
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instance_id: String,
    #[serde(default)]
    pub members: Vec<Member>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Group {
    /// Builds the group identifier `<instance_id>_<slug of name>`.
    pub fn make_id(instance_id: &str, name: &str) -> String {
        format!("{instance_id}_{}", validators::slugify(name))
    }

    pub fn has_member(&self, client_id: &str) -> bool {
        self.members.iter().any(|m| m.client_id == client_id)
    }

    /// Removes and returns the member, if present.
    pub fn take_member(&mut self, client_id: &str) -> Option<Member> {
        let index = self.members.iter().position(|m| m.client_id == client_id)?;
        Some(self.members.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(client: &str) -> Member {
        Member {
            client_id: client.to_string(),
            instance_id: "office".to_string(),
            instance_name: "office".to_string(),
            subnet: "10.8.0.0/24".parse().unwrap(),
            ip: None,
        }
    }

    #[test]
    fn test_make_id() {
        assert_eq!(Group::make_id("office", "Dev Team"), "office_dev_team");
    }

    #[test]
    fn test_take_member() {
        let mut group = Group {
            id: "office_devs".to_string(),
            name: "devs".to_string(),
            description: String::new(),
            instance_id: "office".to_string(),
            members: vec![member("alice"), member("bob")],
            created_at: chrono::Utc::now(),
        };
        assert!(group.has_member("bob"));
        assert_eq!(group.take_member("bob").unwrap().client_id, "bob");
        assert!(!group.has_member("bob"));
        assert!(group.take_member("bob").is_none());
        assert!(group.has_member("alice"));
    }
}
