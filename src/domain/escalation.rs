// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Pure data shapes for the escalation subsystem (spec §3 `EscalationRecord`,
//! §6 "Escalation protocol"). `infrastructure::escalation` owns the durable
//! file-based IPC that produces and consumes these shapes; this module only
//! defines what they mean.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::ToolCallRequest;

/// An in-flight (or just-resolved) escalation. `deadline` is derived from
/// `created_at + escalation_timeout` at construction time.
#[derive(Debug, Clone)]
pub struct EscalationRecord {
    pub escalation_id: Uuid,
    pub request: ToolCallRequest,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(request: ToolCallRequest, reason: impl Into<String>, timeout: chrono::Duration) -> Self {
        let created_at = Utc::now();
        Self {
            escalation_id: Uuid::new_v4(),
            request,
            reason: reason.into(),
            created_at,
            deadline: created_at + timeout,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// The wire shape of `request-<id>.json` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequestFile {
    pub escalation_id: Uuid,
    pub tool_name: String,
    pub server_name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl From<&EscalationRecord> for EscalationRequestFile {
    fn from(record: &EscalationRecord) -> Self {
        Self {
            escalation_id: record.escalation_id,
            tool_name: record.request.tool_name.clone(),
            server_name: record.request.server_name.clone(),
            arguments: record.request.arguments.clone(),
            reason: record.reason.clone(),
            created_at: record.created_at,
        }
    }
}

/// The final, durable verdict of one escalation (spec §3: "human or
/// LLM-assisted escalation"). Distinct from the engine's three-way
/// `Decision` because an escalation can never itself produce `escalate`
/// again — it resolves to one of these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationDecision {
    Approved,
    Denied,
}

impl std::fmt::Display for EscalationDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Denied => write!(f, "denied"),
        }
    }
}

/// The wire shape of `response-<id>.json` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationResponseFile {
    pub decision: EscalationDecision,
}

/// Where an escalation's final decision came from, recorded in the audit
/// trail (`autoApproved?` in spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSource {
    AutoApprover,
    Human,
    Timeout,
}

/// The outcome the orchestrator receives from the escalation handler:
/// the durable decision plus where it came from.
#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    pub decision: EscalationDecision,
    pub source: ApprovalSource,
}
