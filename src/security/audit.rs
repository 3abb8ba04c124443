use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::ids::new_id;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Task,
    Agent,
    Skill,
    Config,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Allowed,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub result: AuditResult,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl AuditLogEntry {
    pub fn new(action: impl Into<String>, resource_type: ResourceType, resource_id: impl Into<String>, result: AuditResult) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            action: action.into(),
            user_id: None,
            device_id: None,
            session_id: None,
            resource_type,
            resource_id: resource_id.into(),
            result,
            reason: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(user_id) = &self.user_id {
            if entry.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Append-only audit log, in-memory by default. Durable persistence is left
/// to the implementation of the Security Service (see DESIGN.md).
#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditLogEntry>>,
    counter: AtomicU64,
}

impl AuditLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn record(&self, entry: AuditLogEntry) {
        self.counter.fetch_add(1, Ordering::Relaxed);
        self.entries.write().await.push(entry);
    }

    pub async fn query(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_filters_by_user_action_and_since() {
        let log = AuditLog::new();
        let mut e1 = AuditLogEntry::new("task:submit", ResourceType::Task, "t1", AuditResult::Allowed);
        e1.user_id = Some("alice".to_string());
        let mut e2 = AuditLogEntry::new("task:submit", ResourceType::Task, "t2", AuditResult::Denied);
        e2.user_id = Some("bob".to_string());
        log.record(e1).await;
        log.record(e2).await;

        let results = log.query(&AuditFilter {
            user_id: Some("alice".to_string()),
            ..Default::default()
        }).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource_id, "t1");
    }

    #[tokio::test]
    async fn log_is_append_only_in_insertion_order() {
        let log = AuditLog::new();
        for i in 0..3 {
            log.record(AuditLogEntry::new(
                "task:submit",
                ResourceType::Task,
                format!("t{i}"),
                AuditResult::Allowed,
            ))
            .await;
        }
        let results = log.query(&AuditFilter::default()).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].resource_id, "t0");
        assert_eq!(results[2].resource_id, "t2");
    }
}
