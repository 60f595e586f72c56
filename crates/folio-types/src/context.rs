//! Diagnostic context attached to structured errors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scoped diagnostic record merged into every error raised inside a scope.
///
/// All named fields are optional so that partial records (a tool wrapper
/// only knows the tool, a stage wrapper only knows the stage) can be merged
/// child-over-parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-form fields (retry statistics, durations, original errors).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge `child` over `self`: every field set in `child` wins.
    pub fn merged_with(&self, child: &ErrorContext) -> ErrorContext {
        let mut extra = self.extra.clone();
        extra.extend(child.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        ErrorContext {
            session_id: child.session_id.clone().or_else(|| self.session_id.clone()),
            stage: child.stage.clone().or_else(|| self.stage.clone()),
            operation: child.operation.clone().or_else(|| self.operation.clone()),
            tool_name: child.tool_name.clone().or_else(|| self.tool_name.clone()),
            request_id: child.request_id.clone().or_else(|| self.request_id.clone()),
            timestamp: child.timestamp.or(self.timestamp),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_prefers_child_fields() {
        let parent = ErrorContext::for_session("s1")
            .with_stage("outline")
            .with_extra("a", 1)
            .with_extra("b", 1);
        let child = ErrorContext::new()
            .with_stage("unit_generation")
            .with_tool("writer")
            .with_extra("b", 2);

        let merged = parent.merged_with(&child);
        assert_eq!(merged.session_id.as_deref(), Some("s1"));
        assert_eq!(merged.stage.as_deref(), Some("unit_generation"));
        assert_eq!(merged.tool_name.as_deref(), Some("writer"));
        assert_eq!(merged.extra["a"], json!(1));
        assert_eq!(merged.extra["b"], json!(2));
    }

    #[test]
    fn serializes_camel_case_and_skips_empty() {
        let ctx = ErrorContext::for_session("s1").with_tool("writer");
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value, json!({"sessionId": "s1", "toolName": "writer"}));
        assert!(ErrorContext::new().is_empty());
    }
}
