// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Tool-call requests and the argument normalization step that turns
//! untrusted, loosely-shaped JSON into the two views the rest of the core
//! needs: `argsForPolicy` (role-normalized) and `argsForTransport` (what the
//! backend actually receives).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::policy_artifact::ToolAnnotation;
use crate::domain::role::{ArgumentRole, RoleError, RoleRegistry};

/// A tool-call argument value, parsed strictly: only strings and
/// string-lists are policy-relevant shapes, everything else is carried
/// through opaquely as `Other` and never treated as a path or URL (§9:
/// "tagged sum type per argument, with a strict parser that rejects unknown
/// shapes early").
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Text(String),
    List(Vec<String>),
    Other(serde_json::Value),
}

impl ArgValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => ArgValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                let mut strings = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        serde_json::Value::String(s) => strings.push(s.clone()),
                        other => return ArgValue::Other(serde_json::Value::Array(vec![other.clone()])),
                    }
                }
                ArgValue::List(strings)
            }
            other => ArgValue::Other(other.clone()),
        }
    }

    pub fn as_strings(&self) -> Vec<&str> {
        match self {
            ArgValue::Text(s) => vec![s.as_str()],
            ArgValue::List(items) => items.iter().map(String::as_str).collect(),
            ArgValue::Other(_) => Vec::new(),
        }
    }
}

/// Parse a raw JSON argument map into the strict shape, never panicking and
/// never rejecting the call outright — unrecognized shapes simply carry no
/// policy-relevant roles and fall through to `default-deny` if a role
/// expected a value it didn't get.
pub fn parse_arguments(raw: &serde_json::Map<String, serde_json::Value>) -> HashMap<String, ArgValue> {
    raw.iter().map(|(k, v)| (k.clone(), ArgValue::from_json(v))).collect()
}

/// A single tool-call request as received from the sandbox. `arguments` is
/// untrusted; nothing here performs any I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub request_id: Uuid,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRequest {
    pub fn new(
        server_name: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            arguments,
            timestamp,
        }
    }
}

/// One normalized value extracted from an argument for a particular role.
#[derive(Debug, Clone)]
pub struct ExtractedValue {
    pub arg_name: String,
    pub raw: String,
    /// Canonical path (for path roles) or resolved+normalized+domain-only
    /// string (for URL roles); identical to `raw` for opaque roles.
    pub normalized: String,
}

/// The outcome of normalizing one request against its annotation: the two
/// views the orchestrator and policy engine need.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub request: ToolCallRequest,
    /// Every annotated role present on this tool, each with its extracted
    /// (and per-role-normalized) values. Opaque roles (`commit-message`,
    /// `branch-name`, `none`) are present too, with `normalized == raw`.
    pub extractions: HashMap<ArgumentRole, Vec<ExtractedValue>>,
    /// What the backend will actually receive: the original arguments with
    /// tilde-expansion applied to path-role values so backends see absolute
    /// paths, everything else untouched.
    pub args_for_transport: serde_json::Map<String, serde_json::Value>,
}

impl NormalizedRequest {
    pub fn values_for_role(&self, role: &ArgumentRole) -> &[ExtractedValue] {
        self.extractions.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn roles_present(&self) -> Vec<ArgumentRole> {
        self.extractions.keys().cloned().collect()
    }

    /// Every extracted value carrying a resource-identifier role (path or
    /// URL), never opaque text (commit messages, branch names). Used by
    /// the escalation handler's auto-approver, which is only ever shown
    /// resolved resource identifiers (spec §4.3), not arbitrary arguments.
    pub fn resource_identifier_values(&self) -> Vec<&ExtractedValue> {
        self.extractions
            .iter()
            .filter(|(role, _)| role.is_resource_identifier())
            .flat_map(|(_, values)| values.iter())
            .collect()
    }
}

/// Normalize `request` against `annotation` using `registry` for
/// per-role canonicalization. Never fails on malformed arguments themselves
/// (those degrade to empty extractions); only fails if a role on the
/// annotation has no registry definition (a startup-time configuration bug,
/// not a per-request one).
pub fn normalize(
    request: ToolCallRequest,
    annotation: &ToolAnnotation,
    registry: &RoleRegistry,
) -> Result<NormalizedRequest, RoleError> {
    let parsed = parse_arguments(&request.arguments);
    let mut extractions: HashMap<ArgumentRole, Vec<ExtractedValue>> = HashMap::new();
    let mut args_for_transport = request.arguments.clone();

    for (arg_name, roles) in &annotation.args {
        let Some(value) = parsed.get(arg_name) else {
            continue;
        };
        for role in roles {
            let definition = registry.get_role_definition(role)?;
            let mut normalized_values = Vec::new();

            for raw in value.as_strings() {
                let normalized = if definition.is_resource_identifier {
                    if role.is_url_role() {
                        let resolved = definition.resolve_for_policy(raw, &request.arguments);
                        let normalized = definition.normalize(&resolved)?;
                        definition.prepare_for_policy(&normalized)
                    } else {
                        definition.normalize(raw)?
                    }
                } else {
                    raw.to_string()
                };
                normalized_values.push(ExtractedValue {
                    arg_name: arg_name.clone(),
                    raw: raw.to_string(),
                    normalized,
                });
            }

            if role.is_path_role() {
                apply_tilde_expansion(&mut args_for_transport, arg_name, value);
            }

            extractions.entry(role.clone()).or_default().extend(normalized_values);
        }
    }

    Ok(NormalizedRequest {
        request,
        extractions,
        args_for_transport,
    })
}

fn apply_tilde_expansion(
    args_for_transport: &mut serde_json::Map<String, serde_json::Value>,
    arg_name: &str,
    value: &ArgValue,
) {
    match value {
        ArgValue::Text(raw) => {
            if let Some(home) = dirs::home_dir() {
                if let Some(rest) = raw.strip_prefix('~') {
                    if rest.is_empty() || rest.starts_with('/') {
                        let expanded = home.join(rest.trim_start_matches('/'));
                        args_for_transport.insert(
                            arg_name.to_string(),
                            serde_json::Value::String(expanded.to_string_lossy().into_owned()),
                        );
                    }
                }
            }
        }
        ArgValue::List(items) => {
            if let Some(home) = dirs::home_dir() {
                let expanded: Vec<serde_json::Value> = items
                    .iter()
                    .map(|raw| {
                        if let Some(rest) = raw.strip_prefix('~') {
                            if rest.is_empty() || rest.starts_with('/') {
                                return serde_json::Value::String(
                                    home.join(rest.trim_start_matches('/')).to_string_lossy().into_owned(),
                                );
                            }
                        }
                        serde_json::Value::String(raw.clone())
                    })
                    .collect();
                args_for_transport.insert(arg_name.to_string(), serde_json::Value::Array(expanded));
            }
        }
        ArgValue::Other(_) => {}
    }
}

/// The engine's verdict for one request (§3 `EvaluationResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub decision: crate::domain::policy_artifact::Decision,
    pub rule_name: String,
    pub reason: String,
}
