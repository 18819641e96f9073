//! TaskType - handler を選ぶためのキー
//!
//! # 命名規約
//! - `{namespace}.{domain}.{action}.v{major}` を推奨
//! - 例: `acme.billing.charge.v1`
//!
//! 規約そのものは強制せず、空文字・空白・長すぎる値だけを弾きます。

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_TASK_TYPE_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    /// Build a task type without validation (registry keys, tests).
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build a task type from untrusted input.
    pub fn parse(s: impl Into<String>) -> Result<Self, String> {
        let value = s.into();
        Self::validate(&value)?;
        Ok(Self(value))
    }

    pub fn validate(value: &str) -> Result<(), String> {
        if value.is_empty() {
            return Err("task type must not be empty".to_string());
        }
        if value.len() > MAX_TASK_TYPE_LEN {
            return Err(format!(
                "task type is {} bytes, limit is {MAX_TASK_TYPE_LEN}",
                value.len()
            ));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(format!("task type '{value}' contains whitespace"));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_bad_values() {
        assert!(TaskType::parse("").is_err());
        assert!(TaskType::parse("has space").is_err());
        assert!(TaskType::parse("x".repeat(MAX_TASK_TYPE_LEN + 1)).is_err());
    }

    #[test]
    fn parse_accepts_dotted_names() {
        let t = TaskType::parse("acme.billing.charge.v1").unwrap();
        assert_eq!(t.as_str(), "acme.billing.charge.v1");
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"acme.billing.charge.v1\"");
    }
}
