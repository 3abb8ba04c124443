use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Immutable metadata describing a spawnable agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRole {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub system_prompt: String,
    pub model: String,
    pub thinking_depth: String,
    pub constraints: Option<Vec<String>>,
}

fn builtin(
    name: &str,
    description: &str,
    capabilities: &[&str],
    tools: &[&str],
    system_prompt: &str,
    thinking_depth: &str,
) -> AgentRole {
    AgentRole {
        name: name.to_string(),
        description: description.to_string(),
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        tools: tools.iter().map(|s| s.to_string()).collect(),
        system_prompt: system_prompt.to_string(),
        model: "claude-sonnet".to_string(),
        thinking_depth: thinking_depth.to_string(),
        constraints: None,
    }
}

fn builtin_roles() -> Vec<AgentRole> {
    vec![
        builtin(
            "code-creator",
            "Writes new code from a description",
            &["code-generation", "scaffolding"],
            &["file-write", "shell"],
            "You write correct, idiomatic code for the described task.",
            "standard",
        ),
        builtin(
            "code-reviewer",
            "Reviews a diff or file for correctness and style",
            &["code-review", "static-analysis"],
            &["file-read"],
            "You review code for bugs, style violations, and missed edge cases.",
            "deep",
        ),
        builtin(
            "test-generator",
            "Generates tests for existing code",
            &["test-generation"],
            &["file-read", "file-write"],
            "You write realistic tests that exercise the described behavior.",
            "standard",
        ),
        builtin(
            "bug-analyzer",
            "Diagnoses the root cause of a reported failure",
            &["debugging", "log-analysis"],
            &["file-read", "shell"],
            "You find the root cause of a bug from the given description and evidence.",
            "deep",
        ),
        builtin(
            "refactor-agent",
            "Restructures code without changing observable behavior",
            &["refactoring"],
            &["file-read", "file-write"],
            "You refactor the described code while preserving behavior.",
            "standard",
        ),
        builtin(
            "documentation-agent",
            "Writes or updates documentation",
            &["documentation"],
            &["file-read", "file-write"],
            "You write clear documentation for the described subject.",
            "shallow",
        ),
        builtin(
            "architecture-advisor",
            "Proposes a design or architecture for a task",
            &["architecture", "design-review"],
            &["file-read"],
            "You propose a design that satisfies the described requirements.",
            "deep",
        ),
    ]
}

/// Holds built-in and custom agent-role metadata. Lookup is by role name;
/// custom roles override built-ins of the same name. Read-only after load —
/// reloading requires rebuilding the registry.
pub struct RoleRegistry {
    roles: HashMap<String, AgentRole>,
}

impl RoleRegistry {
    pub fn with_builtins() -> Self {
        let roles = builtin_roles().into_iter().map(|r| (r.name.clone(), r)).collect();
        Self { roles }
    }

    pub fn get(&self, name: &str) -> Option<&AgentRole> {
        self.roles.get(name)
    }

    pub fn list(&self) -> Vec<&AgentRole> {
        self.roles.values().collect()
    }

    /// Loads custom role definitions from `agents/*.yaml` under `dir`,
    /// overriding built-ins of the same name.
    pub async fn load_custom_roles(&mut self, dir: &Path) -> Result<usize> {
        let agents_dir = dir.join("agents");
        if !agents_dir.is_dir() {
            return Ok(0);
        }

        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(&agents_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            let role: AgentRole = serde_yaml::from_str(&contents)?;
            info!(role = %role.name, path = %path.display(), "loaded custom agent role");
            self.roles.insert(role.name.clone(), role);
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Read-only project-context material: `context.yaml`, `rules.yaml`, and the
/// free-text `architecture.md`. Read once at orchestrator/registry startup;
/// never written by this process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectContext {
    pub context: Option<serde_yaml::Value>,
    pub rules: Option<serde_yaml::Value>,
    pub architecture: Option<String>,
}

pub async fn load_project_context(dir: &Path) -> Result<ProjectContext> {
    let mut ctx = ProjectContext::default();

    let context_path = dir.join("context.yaml");
    if context_path.is_file() {
        let raw = tokio::fs::read_to_string(&context_path).await?;
        ctx.context = Some(serde_yaml::from_str(&raw)?);
    }

    let rules_path = dir.join("rules.yaml");
    if rules_path.is_file() {
        let raw = tokio::fs::read_to_string(&rules_path).await?;
        ctx.rules = Some(serde_yaml::from_str(&raw)?);
    }

    let architecture_path = dir.join("architecture.md");
    if architecture_path.is_file() {
        ctx.architecture = Some(tokio::fs::read_to_string(&architecture_path).await?);
    } else {
        warn!(path = %architecture_path.display(), "no architecture.md found for project context");
    }

    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_all_seven_builtins() {
        let registry = RoleRegistry::with_builtins();
        for name in [
            "code-creator",
            "code-reviewer",
            "test-generator",
            "bug-analyzer",
            "refactor-agent",
            "documentation-agent",
            "architecture-advisor",
        ] {
            assert!(registry.get(name).is_some(), "missing builtin role {name}");
        }
    }

    #[tokio::test]
    async fn custom_role_overrides_builtin_of_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join("agents");
        tokio::fs::create_dir_all(&agents_dir).await.unwrap();
        tokio::fs::write(
            agents_dir.join("code-creator.yaml"),
            r#"
name: code-creator
description: custom override
capabilities: [custom]
tools: [custom-tool]
system_prompt: custom prompt
model: custom-model
thinking_depth: shallow
"#,
        )
        .await
        .unwrap();

        let mut registry = RoleRegistry::with_builtins();
        let loaded = registry.load_custom_roles(dir.path()).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(registry.get("code-creator").unwrap().description, "custom override");
    }

    #[tokio::test]
    async fn missing_agents_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = RoleRegistry::with_builtins();
        let loaded = registry.load_custom_roles(dir.path()).await.unwrap();
        assert_eq!(loaded, 0);
        assert!(registry.get("code-creator").is_some());
    }
}
