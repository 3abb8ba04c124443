pub mod audit;
pub mod identity;
pub mod policy;
pub mod session;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Result, SpiralError};
use audit::{AuditFilter, AuditLog, AuditLogEntry, AuditResult, ResourceType};
use identity::{Device, DeviceType, IdentityProvider, IdentityStore, UserIdentity};
use policy::{Permission, PolicyStore, RepoPolicy};
use session::{
    check_permission, create_session, effective_permissions, PermissionCheckResult,
    RolePermissionTable, Session, SessionStore,
};

/// The outcome of `check_agent_access`/`check_skill_access` — a superset of
/// `PermissionCheckResult` so denial reasons can name a policy rule instead
/// of only a missing permission.
pub type AccessResult = PermissionCheckResult;

/// Identity × device trust × role × repo policy. Every dispatch decision
/// flows through this service. It never raises on ordinary denial — it
/// returns a result; it raises only on internal corruption (a session
/// referencing a vanished device, a session store write failure).
pub struct SecurityService {
    identities: Arc<IdentityStore>,
    sessions: Arc<dyn SessionStore>,
    policies: Arc<PolicyStore>,
    audit_log: Arc<AuditLog>,
    roles: RwLock<RolePermissionTable>,
}

impl SecurityService {
    pub fn new() -> Self {
        Self {
            identities: IdentityStore::new(),
            sessions: session::InMemorySessionStore::new(),
            policies: Arc::new(PolicyStore::new()),
            audit_log: AuditLog::new(),
            roles: RwLock::new(RolePermissionTable::with_builtins()),
        }
    }

    pub async fn authenticate_user(&self, provider: IdentityProvider, subject: &str) -> Result<UserIdentity> {
        self.identities.authenticate_user(provider, subject).await
    }

    pub async fn verify_device(&self, device_id: &str, device_type: DeviceType) -> Result<Device> {
        self.identities.verify_device(device_id, device_type).await
    }

    pub async fn create_session(&self, user_id: String, device_id: String, role_ids: Vec<String>) -> Result<Session> {
        let session = create_session(user_id, device_id, role_ids);
        self.sessions.create(session.clone()).await?;
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.sessions.get(id).await
    }

    pub async fn get_effective_permissions(&self, session: &Session) -> Vec<Permission> {
        let table = self.roles.read().await;
        effective_permissions(session, &table).into_iter().collect()
    }

    pub async fn check_permission(&self, session: &Session, permission: Permission) -> Result<PermissionCheckResult> {
        let table = self.roles.read().await;
        let result = check_permission(session, &table, permission)?;
        self.audit(AuditLogEntry {
            result: if result.allowed { AuditResult::Allowed } else { AuditResult::Denied },
            reason: result.reason.clone(),
            user_id: Some(session.user_id.clone()),
            device_id: Some(session.device_id.clone()),
            session_id: Some(session.id.clone()),
            ..AuditLogEntry::new(permission.as_str(), ResourceType::Config, session.id.clone(), AuditResult::Allowed)
        })
        .await;
        Ok(result)
    }

    /// (1) `agent:invoke`. (2) repo policy for the first scope entry, if any.
    /// (3) intersect session roles with the agent policy's allowed roles.
    /// (4) enforce the agent policy's required device trust.
    pub async fn check_agent_access(&self, session: &Session, agent_id: &str) -> Result<AccessResult> {
        let base = self.check_permission(session, Permission::AgentInvoke).await?;
        if !base.allowed {
            return Ok(base);
        }

        let Some(scope) = session.scope.as_ref().and_then(|s| s.first()) else {
            return Ok(PermissionCheckResult::allow());
        };
        let Some(repo_policy) = self.policies.get(scope).await else {
            return Ok(PermissionCheckResult::allow());
        };
        let Some(agent_policy) = repo_policy.agent_policy(agent_id) else {
            return Ok(PermissionCheckResult::allow());
        };

        if !role_intersection_nonempty(&session.role_ids, &agent_policy.allowed_roles) {
            let result = deny_result(format!(
                "agent {agent_id} requires one of roles {:?}",
                agent_policy.allowed_roles
            ));
            self.record_decision(session, "agent:access", ResourceType::Agent, agent_id, &result).await;
            return Ok(result);
        }

        if let Some(required_trust) = agent_policy.required_trust {
            if !self.device_meets_trust(&session.device_id, required_trust).await? {
                let result = deny_result(format!(
                    "agent {agent_id} requires device trust level {required_trust:?}"
                ));
                self.record_decision(session, "agent:access", ResourceType::Agent, agent_id, &result).await;
                return Ok(result);
            }
        }

        let result = PermissionCheckResult::allow();
        self.record_decision(session, "agent:access", ResourceType::Agent, agent_id, &result).await;
        Ok(result)
    }

    /// (1) `skill:execute`. (2) skill policy via repo policy lookup.
    /// (3) each `required_permissions` entry individually. (4) role
    /// intersection as for agents. (5) dangerous skills deny on untrusted
    /// devices regardless of role.
    pub async fn check_skill_access(&self, session: &Session, skill_id: &str) -> Result<AccessResult> {
        let base = self.check_permission(session, Permission::SkillExecute).await?;
        if !base.allowed {
            return Ok(base);
        }

        let Some(scope) = session.scope.as_ref().and_then(|s| s.first()) else {
            return Ok(PermissionCheckResult::allow());
        };
        let Some(repo_policy) = self.policies.get(scope).await else {
            return Ok(PermissionCheckResult::allow());
        };
        let Some(skill_policy) = repo_policy.skill_policy(skill_id) else {
            return Ok(PermissionCheckResult::allow());
        };

        for required in &skill_policy.required_permissions {
            let result = self.check_permission(session, *required).await?;
            if !result.allowed {
                return Ok(result);
            }
        }

        if !role_intersection_nonempty(&session.role_ids, &skill_policy.allowed_roles) {
            let result = deny_result(format!(
                "skill {skill_id} requires one of roles {:?}",
                skill_policy.allowed_roles
            ));
            self.record_decision(session, "skill:access", ResourceType::Skill, skill_id, &result).await;
            return Ok(result);
        }

        if skill_policy.dangerous {
            let device = self.identities.get_device(&session.device_id).await?;
            let untrusted = device
                .map(|d| d.trust_level == identity::TrustLevel::Untrusted)
                .unwrap_or(true);
            if untrusted {
                let result = deny_result(format!(
                    "skill {skill_id} is dangerous and device trust is untrusted"
                ));
                self.record_decision(session, "skill:access", ResourceType::Skill, skill_id, &result).await;
                return Ok(result);
            }
        }

        let result = PermissionCheckResult::allow();
        self.record_decision(session, "skill:access", ResourceType::Skill, skill_id, &result).await;
        Ok(result)
    }

    async fn record_decision(&self, session: &Session, action: &str, resource_type: ResourceType, resource_id: &str, result: &PermissionCheckResult) {
        self.audit(AuditLogEntry {
            result: if result.allowed { AuditResult::Allowed } else { AuditResult::Denied },
            reason: result.reason.clone(),
            user_id: Some(session.user_id.clone()),
            device_id: Some(session.device_id.clone()),
            session_id: Some(session.id.clone()),
            ..AuditLogEntry::new(action, resource_type, resource_id, AuditResult::Allowed)
        })
        .await;
    }

    async fn device_meets_trust(&self, device_id: &str, required: identity::TrustLevel) -> Result<bool> {
        match self.identities.get_device(device_id).await? {
            Some(device) => Ok(device.trust_level >= required),
            None => Ok(false),
        }
    }

    pub async fn audit(&self, entry: AuditLogEntry) {
        info!(action = %entry.action, result = ?entry.result, "audit entry recorded");
        self.audit_log.record(entry).await;
    }

    pub async fn get_audit_log(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.audit_log.query(filter).await
    }

    pub async fn get_repo_policy(&self, path: &str) -> Option<RepoPolicy> {
        self.policies.get(path).await
    }

    pub async fn set_repo_policy(&self, policy: RepoPolicy) {
        self.policies.set(policy).await;
    }

    pub async fn set_role_permissions(&self, role: impl Into<String>, permissions: std::collections::HashSet<Permission>) {
        self.roles.write().await.set(role, permissions);
    }
}

impl Default for SecurityService {
    fn default() -> Self {
        Self::new()
    }
}

fn role_intersection_nonempty(session_roles: &[String], allowed_roles: &[String]) -> bool {
    if allowed_roles.is_empty() {
        return true;
    }
    session_roles.iter().any(|r| allowed_roles.contains(r))
}

fn deny_result(reason: String) -> PermissionCheckResult {
    PermissionCheckResult {
        allowed: false,
        reason: Some(reason),
        required: None,
        missing: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::{DeviceType, TrustLevel};
    use crate::security::policy::{AgentPolicy, SkillPolicy};

    async fn session_with_roles(svc: &SecurityService, roles: Vec<&str>) -> Session {
        svc.verify_device("d1", DeviceType::Desktop).await.unwrap();
        svc.create_session(
            "u1".to_string(),
            "d1".to_string(),
            roles.into_iter().map(str::to_string).collect(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn readonly_denied_task_submit_admin_allowed() {
        let svc = SecurityService::new();
        let readonly = session_with_roles(&svc, vec!["readonly"]).await;
        let result = svc.check_permission(&readonly, Permission::TaskSubmit).await.unwrap();
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains("task:submit"));

        let admin = session_with_roles(&svc, vec!["admin"]).await;
        let result = svc.check_permission(&admin, Permission::TaskSubmit).await.unwrap();
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn dangerous_skill_denied_on_untrusted_device() {
        let svc = SecurityService::new();
        svc.set_repo_policy(RepoPolicy {
            repo_path: "/repo".to_string(),
            enforce_trust: true,
            min_trust_level: TrustLevel::Untrusted,
            allowed_roles: vec!["developer".to_string()],
            allowed_users: None,
            denied_users: None,
            agent_policies: vec![],
            skill_policies: vec![SkillPolicy {
                skill_id: "shell-exec".to_string(),
                required_permissions: vec![],
                allowed_roles: vec!["developer".to_string()],
                required_trust: None,
                dangerous: true,
            }],
        })
        .await;

        let mut session = session_with_roles(&svc, vec!["developer"]).await;
        session.scope = Some(vec!["/repo".to_string()]);

        let result = svc.check_skill_access(&session, "shell-exec").await.unwrap();
        assert!(!result.allowed);
        let reason = result.reason.unwrap();
        assert!(reason.contains("dangerous"));
    }

    #[tokio::test]
    async fn agent_access_denied_when_role_not_allowed() {
        let svc = SecurityService::new();
        svc.set_repo_policy(RepoPolicy {
            repo_path: "/repo".to_string(),
            enforce_trust: false,
            min_trust_level: TrustLevel::Untrusted,
            allowed_roles: vec![],
            allowed_users: None,
            denied_users: None,
            agent_policies: vec![AgentPolicy {
                agent_id: "code-creator".to_string(),
                allowed_roles: vec!["senior-dev".to_string()],
                denied_roles: vec![],
                required_trust: None,
            }],
            skill_policies: vec![],
        })
        .await;

        let mut session = session_with_roles(&svc, vec!["developer"]).await;
        session.scope = Some(vec!["/repo".to_string()]);

        let result = svc.check_agent_access(&session, "code-creator").await.unwrap();
        assert!(!result.allowed);
    }
}
