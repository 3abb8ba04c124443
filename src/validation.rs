//! Input validation and sanitization for task descriptions submitted through
//! the local API.
use crate::SpiralError;
use html_escape::encode_text;
use regex::Regex;
use std::collections::HashSet;

pub const MAX_TASK_CONTENT_LENGTH: usize = 10000;
pub const MAX_CONTEXT_KEY_LENGTH: usize = 100;
pub const MAX_CONTEXT_VALUE_LENGTH: usize = 1000;

static SAFE_TASK_CONTENT_REGEX: &str =
    r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

/// Allowlist-style denylist of known attack vectors (XSS, shell/SQL
/// injection, path traversal) checked before the character allowlist.
static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "`del",
    "$(rm",
    "$(del",
    "';",
    "\";",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
    "C:\\Windows\\System32",
];

#[derive(Debug, Clone)]
pub struct TaskContentValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl TaskContentValidator {
    pub fn new() -> Result<Self, SpiralError> {
        let safe_content_regex = Regex::new(SAFE_TASK_CONTENT_REGEX)
            .map_err(|e| SpiralError::ConfigurationError(format!("Invalid regex pattern: {e}")))?;

        let dangerous_patterns: HashSet<String> = DANGEROUS_PATTERNS
            .iter()
            .map(|s| s.to_lowercase())
            .collect();

        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    pub fn validate_and_sanitize_task_content(&self, content: &str) -> Result<String, SpiralError> {
        if content.len() > MAX_TASK_CONTENT_LENGTH {
            return Err(SpiralError::Validation(format!(
                "task content exceeds maximum length of {MAX_TASK_CONTENT_LENGTH} characters"
            )));
        }

        if content.trim().is_empty() {
            return Err(SpiralError::Validation("task content cannot be empty".to_string()));
        }

        let content_lower = content.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if content_lower.contains(pattern) {
                return Err(SpiralError::Validation(
                    "task content contains potentially dangerous patterns".to_string(),
                ));
            }
        }

        if !self.safe_content_regex.is_match(content) {
            return Err(SpiralError::Validation("task content contains invalid characters".to_string()));
        }

        Ok(encode_text(content).to_string())
    }

    pub fn validate_context_key(&self, key: &str) -> Result<(), SpiralError> {
        if key.is_empty() || key.len() > MAX_CONTEXT_KEY_LENGTH {
            return Err(SpiralError::Validation(format!(
                "context key must be non-empty and under {MAX_CONTEXT_KEY_LENGTH} characters"
            )));
        }

        if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(SpiralError::Validation(
                "context keys can only contain alphanumeric characters and underscores".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_and_sanitize_context_value(&self, value: &str) -> Result<String, SpiralError> {
        if value.len() > MAX_CONTEXT_VALUE_LENGTH {
            return Err(SpiralError::Validation(format!(
                "context value exceeds maximum length of {MAX_CONTEXT_VALUE_LENGTH} characters"
            )));
        }

        let value_lower = value.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if value_lower.contains(pattern) {
                return Err(SpiralError::Validation(
                    "context value contains potentially dangerous patterns".to_string(),
                ));
            }
        }

        Ok(encode_text(value).to_string())
    }
}

impl Default for TaskContentValidator {
    fn default() -> Self {
        Self::new().expect("hardcoded regex must compile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_content_passes() {
        let validator = TaskContentValidator::new().unwrap();
        let result = validator.validate_and_sanitize_task_content("Create a hello world function in Rust");
        assert!(result.is_ok());
    }

    #[test]
    fn script_injection_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        let result = validator.validate_and_sanitize_task_content("Create a function <script>alert('xss')</script>");
        assert!(result.is_err());
    }

    #[test]
    fn command_injection_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        let result = validator.validate_and_sanitize_task_content("Create file && rm -rf /");
        assert!(result.is_err());
    }

    #[test]
    fn empty_content_blocked() {
        let validator = TaskContentValidator::new().unwrap();
        assert!(validator.validate_and_sanitize_task_content("").is_err());
    }

    #[test]
    fn content_at_and_over_limit() {
        let validator = TaskContentValidator::new().unwrap();
        let boundary = "x".repeat(MAX_TASK_CONTENT_LENGTH);
        assert!(validator.validate_and_sanitize_task_content(&boundary).is_ok());
        let over = "x".repeat(MAX_TASK_CONTENT_LENGTH + 1);
        assert!(validator.validate_and_sanitize_task_content(&over).is_err());
    }

    #[test]
    fn context_key_validation() {
        let validator = TaskContentValidator::new().unwrap();
        for key in ["project_type", "file_path", "priority_hint"] {
            assert!(validator.validate_context_key(key).is_ok());
        }
        for key in ["", "key with spaces", "key-with-dashes", "key/with/slashes"] {
            assert!(validator.validate_context_key(key).is_err());
        }
    }

    #[test]
    fn context_value_sanitization() {
        let validator = TaskContentValidator::new().unwrap();
        for value in ["rust", "web application", "unit tests"] {
            assert!(validator.validate_and_sanitize_context_value(value).is_ok());
        }
        for value in ["<script>alert('xss')</script>", "'; DROP TABLE users; --"] {
            assert!(validator.validate_and_sanitize_context_value(value).is_err());
        }
    }

    #[test]
    fn validation_is_idempotent() {
        let validator = TaskContentValidator::new().unwrap();
        let input = "Text with ampersands & symbols";
        assert_eq!(
            validator.validate_and_sanitize_task_content(input).unwrap(),
            validator.validate_and_sanitize_task_content(input).unwrap()
        );
    }
}
