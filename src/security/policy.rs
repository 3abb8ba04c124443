use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::security::identity::TrustLevel;

/// Closed vocabulary of permission strings. `AdminAll` satisfies every check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    TaskSubmit,
    TaskRead,
    TaskCancel,
    AgentInvoke,
    SkillExecute,
    ConfigRead,
    ConfigWrite,
    AdminAll,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::TaskSubmit => "task:submit",
            Permission::TaskRead => "task:read",
            Permission::TaskCancel => "task:cancel",
            Permission::AgentInvoke => "agent:invoke",
            Permission::SkillExecute => "skill:execute",
            Permission::ConfigRead => "config:read",
            Permission::ConfigWrite => "config:write",
            Permission::AdminAll => "admin:all",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub agent_id: String,
    pub allowed_roles: Vec<String>,
    pub denied_roles: Vec<String>,
    pub required_trust: Option<TrustLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPolicy {
    pub skill_id: String,
    pub required_permissions: Vec<Permission>,
    pub allowed_roles: Vec<String>,
    pub required_trust: Option<TrustLevel>,
    pub dangerous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoPolicy {
    pub repo_path: String,
    pub enforce_trust: bool,
    pub min_trust_level: TrustLevel,
    pub allowed_roles: Vec<String>,
    pub allowed_users: Option<Vec<String>>,
    pub denied_users: Option<Vec<String>>,
    pub agent_policies: Vec<AgentPolicy>,
    pub skill_policies: Vec<SkillPolicy>,
}

impl RepoPolicy {
    pub fn agent_policy(&self, agent_id: &str) -> Option<&AgentPolicy> {
        self.agent_policies.iter().find(|p| p.agent_id == agent_id)
    }

    pub fn skill_policy(&self, skill_id: &str) -> Option<&SkillPolicy> {
        self.skill_policies.iter().find(|p| p.skill_id == skill_id)
    }
}

/// The role table and repo policies are read-only at runtime once loaded.
#[derive(Default)]
pub struct PolicyStore {
    repos: RwLock<HashMap<String, RepoPolicy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, repo_path: &str) -> Option<RepoPolicy> {
        self.repos.read().await.get(repo_path).cloned()
    }

    pub async fn set(&self, policy: RepoPolicy) {
        self.repos.write().await.insert(policy.repo_path.clone(), policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_repo_policy() {
        let store = PolicyStore::new();
        let policy = RepoPolicy {
            repo_path: "/repo".to_string(),
            enforce_trust: true,
            min_trust_level: TrustLevel::Verified,
            allowed_roles: vec!["developer".to_string()],
            allowed_users: None,
            denied_users: None,
            agent_policies: vec![],
            skill_policies: vec![],
        };
        store.set(policy.clone()).await;
        let loaded = store.get("/repo").await.unwrap();
        assert_eq!(loaded.repo_path, policy.repo_path);
        assert_eq!(loaded.min_trust_level, policy.min_trust_level);
    }
}
