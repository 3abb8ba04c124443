use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::constants::DEFAULT_SESSION_DURATION_HOURS;
use crate::error::{Result, SpiralError};
use crate::ids::new_id;
use crate::security::policy::Permission;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub role_ids: Vec<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: Option<Vec<String>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<()> {
        self.sessions.write().await.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }
}

/// Maps RBAC role names (e.g. `readonly`, `developer`, `admin`) to permission
/// sets. This is distinct from the Role Registry's agent roles
/// (`code-creator`, etc.), which drive spawned-agent behavior rather than
/// authorization.
#[derive(Default)]
pub struct RolePermissionTable {
    roles: HashMap<String, HashSet<Permission>>,
}

impl RolePermissionTable {
    pub fn with_builtins() -> Self {
        let mut roles = HashMap::new();
        roles.insert(
            "readonly".to_string(),
            HashSet::from([Permission::TaskRead, Permission::ConfigRead]),
        );
        roles.insert(
            "developer".to_string(),
            HashSet::from([
                Permission::TaskSubmit,
                Permission::TaskRead,
                Permission::TaskCancel,
                Permission::AgentInvoke,
                Permission::SkillExecute,
            ]),
        );
        roles.insert("admin".to_string(), HashSet::from([Permission::AdminAll]));
        Self { roles }
    }

    pub fn set(&mut self, role: impl Into<String>, permissions: HashSet<Permission>) {
        self.roles.insert(role.into(), permissions);
    }

    pub fn permissions_for(&self, role: &str) -> HashSet<Permission> {
        self.roles.get(role).cloned().unwrap_or_default()
    }
}

pub struct CheckContext<'a> {
    pub session: &'a Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionCheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub required: Option<Permission>,
    pub missing: Option<Permission>,
}

impl PermissionCheckResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            required: None,
            missing: None,
        }
    }

    pub fn deny(reason: impl Into<String>, missing: Permission) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            required: Some(missing),
            missing: Some(missing),
        }
    }
}

pub fn new_session_id() -> String {
    new_id()
}

pub fn create_session(user_id: String, device_id: String, role_ids: Vec<String>) -> Session {
    let now = Utc::now();
    Session {
        id: new_session_id(),
        user_id,
        device_id,
        role_ids,
        granted_at: now,
        expires_at: now + Duration::hours(DEFAULT_SESSION_DURATION_HOURS),
        scope: None,
    }
}

/// Effective permissions equal the set-union of the permissions of the
/// session's roles.
pub fn effective_permissions(session: &Session, table: &RolePermissionTable) -> HashSet<Permission> {
    session
        .role_ids
        .iter()
        .flat_map(|role| table.permissions_for(role))
        .collect()
}

/// `admin:all` satisfies every check; otherwise the specific permission must
/// be present. Expired sessions always deny with `SessionExpired`.
pub fn check_permission(
    session: &Session,
    table: &RolePermissionTable,
    permission: Permission,
) -> std::result::Result<PermissionCheckResult, SpiralError> {
    if session.is_expired() {
        return Err(SpiralError::SessionExpired);
    }

    let effective = effective_permissions(session, table);
    if effective.contains(&Permission::AdminAll) {
        return Ok(PermissionCheckResult::allow());
    }
    if effective.contains(&permission) {
        return Ok(PermissionCheckResult::allow());
    }
    Ok(PermissionCheckResult::deny(
        format!("missing permission {}", permission.as_str()),
        permission,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_permissions_is_set_union_of_roles() {
        let table = RolePermissionTable::with_builtins();
        let session = create_session("u1".to_string(), "d1".to_string(), vec!["readonly".to_string(), "developer".to_string()]);
        let perms = effective_permissions(&session, &table);
        assert!(perms.contains(&Permission::TaskSubmit));
        assert!(perms.contains(&Permission::ConfigRead));
    }

    #[test]
    fn admin_all_satisfies_every_check() {
        let table = RolePermissionTable::with_builtins();
        let session = create_session("u1".to_string(), "d1".to_string(), vec!["admin".to_string()]);
        let result = check_permission(&session, &table, Permission::ConfigWrite).unwrap();
        assert!(result.allowed);
    }

    #[test]
    fn deny_names_the_missing_permission() {
        let table = RolePermissionTable::with_builtins();
        let session = create_session("u1".to_string(), "d1".to_string(), vec!["readonly".to_string()]);
        let result = check_permission(&session, &table, Permission::TaskSubmit).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.missing, Some(Permission::TaskSubmit));
        assert!(result.reason.unwrap().contains("task:submit"));
    }

    #[test]
    fn expired_session_denies_with_session_expired() {
        let table = RolePermissionTable::with_builtins();
        let mut session = create_session("u1".to_string(), "d1".to_string(), vec!["admin".to_string()]);
        session.expires_at = Utc::now() - Duration::seconds(1);
        let result = check_permission(&session, &table, Permission::TaskRead);
        assert!(matches!(result, Err(SpiralError::SessionExpired)));
    }
}
