// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! The shape of one audit-log entry (spec §3 `AuditEntry`). Pure data;
//! `infrastructure::audit_log` owns serializing, redacting, and appending
//! it to the JSONL file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::policy_artifact::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Denied,
    Error,
}

/// The outcome of forwarding (or not forwarding) a call, as recorded in
/// the audit trail. Redaction (spec §4.4) must not alter the *meaning* of
/// `status` even though it may rewrite `content`/`error` strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditResult {
    pub fn success(content: Option<String>) -> Self {
        Self {
            status: ResultStatus::Success,
            content,
            error: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            status: ResultStatus::Denied,
            content: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            content: None,
            error: Some(message.into()),
        }
    }
}

/// One complete, append-only audit record (spec §3). Written exactly once
/// per completed request; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub server_name: String,
    pub tool_name: String,
    /// Post-redaction transport arguments (spec §4.6 step 7).
    pub arguments: serde_json::Value,
    pub policy_decision: Decision,
    pub rule_name: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_approved: Option<bool>,
    pub result: AuditResult,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_entry_serializes_without_optional_fields() {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            request_id: Uuid::new_v4(),
            server_name: "fs".to_string(),
            tool_name: "read_file".to_string(),
            arguments: serde_json::json!({"path": "/sandbox/a.txt"}),
            policy_decision: Decision::Allow,
            rule_name: "structural-sandbox-allow".to_string(),
            reason: "within sandbox".to_string(),
            escalation_result: None,
            auto_approved: None,
            result: AuditResult::success(Some("contents".to_string())),
            duration_ms: 4,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("escalation_result"));
        assert!(!json.contains("auto_approved"));
    }
}
