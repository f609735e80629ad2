// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Trusted Process Orchestrator (spec §4.6/§5): the per-request pipeline
//! that wires every other module together. This is the one place in the
//! crate that performs I/O in a fixed order — normalize, evaluate,
//! (maybe) escalate, (maybe) forward, then audit — and the ordering
//! itself is part of the contract (§5 "the audit entry is written after
//! the backend call completes... and before the response is returned").

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::domain::audit::{AuditEntry, AuditResult};
use crate::domain::config::RuntimeConfig;
use crate::domain::escalation::{ApprovalSource, EscalationDecision, EscalationRecord};
use crate::domain::policy_artifact::{Decision, PolicyArtifacts};
use crate::domain::policy_engine::{self, StructuralConfig};
use crate::domain::request::{normalize, ExtractedValue, ToolCallRequest};
use crate::domain::role::{canonicalize_path, ArgumentRole, RoleRegistry};
use crate::infrastructure::audit_log::{AuditLog, AuditLogError};
use crate::infrastructure::connection_manager::{BackendError, ConnectionManager, Root};
use crate::infrastructure::escalation::{EscalationError, EscalationHandler};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to open audit log: {0}")]
    AuditLog(#[from] AuditLogError),
    #[error("failed to start escalation handler: {0}")]
    Escalation(#[from] EscalationError),
}

/// What the orchestrator hands back to whatever (out-of-scope) transport
/// layer dispatched the request.
#[derive(Debug, Clone)]
pub struct OrchestratorOutcome {
    pub decision: Decision,
    pub rule_name: String,
    pub reason: String,
    pub result: AuditResult,
    pub duration_ms: u64,
}

pub struct Orchestrator {
    artifacts: PolicyArtifacts,
    structural_config: StructuralConfig,
    registry: RoleRegistry,
    connection_manager: Arc<ConnectionManager>,
    escalation_handler: Arc<EscalationHandler>,
    escalation_timeout: Duration,
    audit_log: AuditLog,
}

impl Orchestrator {
    /// Build the orchestrator from already-loaded artifacts and an
    /// already-registered connection manager (connecting to backends is
    /// the out-of-scope transport layer's job, per spec §1). Opens the
    /// audit log and starts the escalation directory watcher; both are
    /// startup-time failures (spec §7 "Configuration errors").
    pub fn new(
        artifacts: PolicyArtifacts,
        config: &RuntimeConfig,
        registry: RoleRegistry,
        connection_manager: Arc<ConnectionManager>,
        escalation_handler: Arc<EscalationHandler>,
    ) -> Result<Self, OrchestratorError> {
        let audit_log = AuditLog::open(&config.audit_log_path, config.audit_redaction_enabled)?;

        let sandbox_dir = canonicalize_path(&config.sandbox_dir.to_string_lossy())
            .unwrap_or_else(|_| config.sandbox_dir.to_string_lossy().into_owned());
        let protected_paths = config
            .protected_paths
            .iter()
            .map(|p| canonicalize_path(&p.to_string_lossy()).unwrap_or_else(|_| p.to_string_lossy().into_owned()))
            .collect();

        Ok(Self {
            artifacts,
            structural_config: StructuralConfig {
                sandbox_dir,
                protected_paths,
            },
            registry,
            connection_manager,
            escalation_handler,
            escalation_timeout: config.escalation_timeout,
            audit_log,
        })
    }

    /// Run one request through the full pipeline (spec §4.6 steps 1-8).
    /// `user_message` is the outer conversation turn's user text, if the
    /// caller captures one; it is only ever used to build the
    /// auto-approver's prompt (spec §4.3), never logged or audited itself.
    pub async fn handle_request(&self, request: ToolCallRequest, user_message: Option<&str>) -> OrchestratorOutcome {
        let started = Instant::now();
        let request_id = request.request_id;
        let server_name = request.server_name.clone();
        let tool_name = request.tool_name.clone();

        // Step 1: annotation lookup.
        let Some(annotation) = self.artifacts.annotations.get(&server_name, &tool_name).cloned() else {
            let eval = policy_engine::evaluate_missing_annotation();
            tracing::warn!(request_id = %request_id, server = %server_name, tool = %tool_name, "missing annotation");
            return self
                .finish(
                    request_id,
                    server_name,
                    tool_name,
                    serde_json::Value::Object(request.arguments),
                    eval,
                    None,
                    None,
                    AuditResult::denied(),
                    started,
                )
                .await;
        };

        // Step 2: normalize into argsForPolicy / argsForTransport.
        let normalized = match normalize(request, &annotation, &self.registry) {
            Ok(n) => n,
            Err(err) => {
                tracing::error!(request_id = %request_id, error = %err, "normalization failed, treating as default-deny");
                let eval = crate::domain::request::EvaluationResult {
                    decision: Decision::Deny,
                    rule_name: "normalization-error".to_string(),
                    reason: err.to_string(),
                };
                return self
                    .finish(
                        request_id,
                        server_name,
                        tool_name,
                        serde_json::Value::Null,
                        eval,
                        None,
                        None,
                        AuditResult::error(err.to_string()),
                        started,
                    )
                    .await;
            }
        };

        // Step 3: evaluate policy.
        let mut evaluation = policy_engine::evaluate(&normalized, &self.artifacts, &self.structural_config);

        let mut escalation_result = None;
        let mut auto_approved = None;

        // Step 4: escalation, with an optional auto-approval attempt first.
        if evaluation.decision == Decision::Escalate {
            let timeout = chrono::Duration::from_std(self.escalation_timeout).unwrap_or_else(|_| chrono::Duration::seconds(300));
            let record = EscalationRecord::new(normalized.request.clone(), evaluation.reason.clone(), timeout);
            let identifiers = normalized.resource_identifier_values();

            let outcome = self.escalation_handler.prompt(&record, &server_name, user_message, &identifiers).await;

            escalation_result = Some(outcome.decision.to_string());
            auto_approved = Some(outcome.source == ApprovalSource::AutoApprover);

            evaluation = match outcome.decision {
                EscalationDecision::Approved => crate::domain::request::EvaluationResult {
                    decision: Decision::Allow,
                    rule_name: "escalation-approved".to_string(),
                    reason: format!("approved via {:?}", outcome.source),
                },
                EscalationDecision::Denied => crate::domain::request::EvaluationResult {
                    decision: Decision::Deny,
                    rule_name: "escalation-denied".to_string(),
                    reason: describe_denial(outcome.source),
                },
            };
        }

        // Step 5: on approval, expand roots for every resource path so a
        // cooperating backend's own containment accepts the forwarded call.
        if evaluation.decision == Decision::Allow {
            self.expand_roots(&server_name, &normalized.resource_identifier_values()).await;
        }

        // Step 6: forward to the backend on allow.
        let audit_result = if evaluation.decision == Decision::Allow {
            match self
                .connection_manager
                .call_tool(&server_name, &tool_name, &normalized.args_for_transport)
                .await
            {
                Ok(outcome) if !outcome.is_error => AuditResult::success(Some(outcome.text)),
                Ok(outcome) => AuditResult::error(outcome.text),
                Err(err) => AuditResult::error(err.to_string()),
            }
        } else {
            AuditResult::denied()
        };

        self.finish(
            request_id,
            server_name,
            tool_name,
            serde_json::Value::Object(normalized.args_for_transport),
            evaluation,
            escalation_result,
            auto_approved,
            audit_result,
            started,
        )
        .await
    }

    /// Add a root for every path-role resource identifier's containing
    /// directory. Best-effort per backend: `ConnectionManager::add_root`
    /// already bounds its own wait and never fails the caller (spec §4.5).
    async fn expand_roots(&self, server_name: &str, identifiers: &[&ExtractedValue]) {
        for value in identifiers {
            if let Some(root) = root_for_path(&value.normalized) {
                if let Err(err) = self.connection_manager.add_root(server_name, root).await {
                    tracing::warn!(server = server_name, error = %err, "root expansion failed");
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        request_id: uuid::Uuid,
        server_name: String,
        tool_name: String,
        arguments: serde_json::Value,
        evaluation: crate::domain::request::EvaluationResult,
        escalation_result: Option<String>,
        auto_approved: Option<bool>,
        result: AuditResult,
        started: Instant,
    ) -> OrchestratorOutcome {
        let duration_ms = started.elapsed().as_millis() as u64;

        match evaluation.decision {
            Decision::Deny => tracing::warn!(request_id = %request_id, rule = %evaluation.rule_name, "denied"),
            Decision::Escalate => tracing::warn!(request_id = %request_id, rule = %evaluation.rule_name, "escalated"),
            Decision::Allow => tracing::debug!(request_id = %request_id, rule = %evaluation.rule_name, "allowed"),
        }

        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            request_id,
            server_name,
            tool_name,
            arguments,
            policy_decision: evaluation.decision,
            rule_name: evaluation.rule_name.clone(),
            reason: evaluation.reason.clone(),
            escalation_result,
            auto_approved,
            result: result.clone(),
            duration_ms,
        };
        self.audit_log.append(&entry);

        OrchestratorOutcome {
            decision: evaluation.decision,
            rule_name: evaluation.rule_name,
            reason: evaluation.reason,
            result,
            duration_ms,
        }
    }

    /// Close all backends, flush the audit log, and stop taking new
    /// escalation prompts (spec §5 "Cancellation semantics"). The escalation
    /// watcher itself stops when `escalation_handler`'s last `Arc` drops.
    pub async fn shutdown(&self) {
        self.connection_manager.shutdown().await;
        self.audit_log.close();
    }
}

fn describe_denial(source: ApprovalSource) -> String {
    match source {
        ApprovalSource::Timeout => "escalation timed out waiting for a decision".to_string(),
        ApprovalSource::Human => "denied by human review".to_string(),
        ApprovalSource::AutoApprover => "auto-approver declined to approve".to_string(),
    }
}

/// The directory containing a resolved path, expressed as a `Root` (spec
/// §3). URL-role identifiers have no filesystem directory and are skipped
/// by the caller before this is reached.
fn root_for_path(normalized_path: &str) -> Option<Root> {
    let path = std::path::Path::new(normalized_path);
    let dir = if path.is_dir() { path } else { path.parent()? };
    Some(Root {
        uri: format!("file://{}", dir.display()),
        name: dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| dir.display().to_string()),
    })
}
