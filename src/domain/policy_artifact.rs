// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! The three static artifacts the policy-compilation pipeline (an external
//! collaborator, out of scope here) produces: tool annotations, the compiled
//! rule chain, and per-server domain allowlists. This module only defines
//! their shapes and the in-memory lookup structures built from them;
//! `infrastructure::policy_loader` owns deserializing them from disk.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::role::ArgumentRole;

/// `(serverName, toolName)` — the natural key tools are annotated and
/// looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolKey {
    pub server_name: String,
    pub tool_name: String,
}

impl ToolKey {
    pub fn new(server_name: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            tool_name: tool_name.into(),
        }
    }
}

/// Immutable, loaded-once description of one tool exposed by a backend.
///
/// Invariant: every tool a backend actually exposes must have one of these;
/// its absence is a hard deny (`structural-unknown-tool`), enforced in
/// `domain::policy_engine`, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotation {
    pub server_name: String,
    pub tool_name: String,
    pub comment: String,
    pub side_effects: bool,
    /// Each argument may carry more than one semantic role (e.g. a single
    /// string argument that is simultaneously an opaque label and, under
    /// some annotations, a path).
    pub args: HashMap<String, Vec<ArgumentRole>>,
}

impl ToolAnnotation {
    pub fn key(&self) -> ToolKey {
        ToolKey::new(self.server_name.clone(), self.tool_name.clone())
    }

    /// All roles actually annotated on this tool, deduplicated.
    pub fn roles_present(&self) -> Vec<ArgumentRole> {
        let mut seen = Vec::new();
        for roles in self.args.values() {
            for role in roles {
                if !seen.contains(role) {
                    seen.push(role.clone());
                }
            }
        }
        seen
    }

    pub fn arg_names_for_role(&self, role: &ArgumentRole) -> Vec<&str> {
        self.args
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// One server's full tool surface, as reported by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAnnotations {
    pub input_hash: String,
    pub tools: Vec<ToolAnnotation>,
}

/// Lookup table built from the annotations artifact.
#[derive(Debug, Clone, Default)]
pub struct AnnotationTable {
    by_key: HashMap<ToolKey, ToolAnnotation>,
}

impl AnnotationTable {
    pub fn from_servers(servers: HashMap<String, ServerAnnotations>) -> Self {
        let mut by_key = HashMap::new();
        for annotations in servers.into_values() {
            for tool in annotations.tools {
                by_key.insert(tool.key(), tool);
            }
        }
        Self { by_key }
    }

    pub fn get(&self, server_name: &str, tool_name: &str) -> Option<&ToolAnnotation> {
        self.by_key.get(&ToolKey::new(server_name, tool_name))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Every distinct role value appearing anywhere in the loaded
    /// annotations; used to drive the role registry's startup completeness
    /// assertion.
    pub fn roles_in_use(&self) -> std::collections::HashSet<ArgumentRole> {
        let mut set = std::collections::HashSet::new();
        for annotation in self.by_key.values() {
            for roles in annotation.args.values() {
                set.extend(roles.iter().cloned());
            }
        }
        set
    }
}

/// Final verdict a rule (or a structural invariant) can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Ordered so `Decision::max` implements most-restrictive-wins
    /// (`deny > escalate > allow`).
    Allow,
    Escalate,
    Deny,
}

impl Decision {
    pub fn most_restrictive(self, other: Decision) -> Decision {
        std::cmp::max(self, other)
    }
}

/// `paths`/`domains` condition clause: a role set plus the constraint those
/// roles' extracted values must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsClause {
    pub roles: Vec<ArgumentRole>,
    pub within: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainsClause {
    pub roles: Vec<ArgumentRole>,
    pub allowed: Vec<String>,
}

/// AND of optional clauses (§3). A clause that is `None` imposes no
/// constraint and is trivially satisfied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<ArgumentRole>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathsClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainsClause>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledRule {
    pub name: String,
    pub description: String,
    pub principle: String,
    #[serde(rename = "if")]
    pub condition: Condition,
    #[serde(rename = "then")]
    pub decision: Decision,
    pub reason: String,
}

/// Ordered rule chain plus the provenance hashes used by the freshness
/// check (§6). Rule order is semantically significant: first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPolicy {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub constitution_hash: String,
    pub input_hash: String,
    pub rules: Vec<CompiledRule>,
}

/// Per-server URL-role allowlist (`domains` structural check, §4.2 Phase
/// 1.3). Absence of an entry for a server means "no allowlist configured" —
/// URL roles are not constrained at the structural layer for that server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerDomainAllowlist {
    pub allowed: HashMap<String, Vec<String>>,
}

impl ServerDomainAllowlist {
    pub fn for_server(&self, server_name: &str) -> Option<&[String]> {
        self.allowed.get(server_name).map(Vec::as_slice)
    }
}

/// Wildcard domain match: exact, `*` (any), or `*.host` suffix (§4.2).
pub fn domain_matches_allowlist(domain: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|pattern| domain_matches_pattern(domain, pattern))
}

pub fn domain_matches_pattern(domain: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{suffix}"));
    }
    domain == pattern
}

/// The three artifacts bundled together, as held by the running process
/// once loaded.
#[derive(Debug, Clone)]
pub struct PolicyArtifacts {
    pub annotations: AnnotationTable,
    pub policy: CompiledPolicy,
    pub domain_allowlists: ServerDomainAllowlist,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_ordering_is_most_restrictive_wins() {
        assert_eq!(Decision::Allow.most_restrictive(Decision::Deny), Decision::Deny);
        assert_eq!(Decision::Allow.most_restrictive(Decision::Escalate), Decision::Escalate);
        assert_eq!(Decision::Escalate.most_restrictive(Decision::Deny), Decision::Deny);
        assert_eq!(Decision::Allow.most_restrictive(Decision::Allow), Decision::Allow);
    }

    #[test]
    fn wildcard_domain_matching() {
        assert!(domain_matches_allowlist("example.gov", &["*.gov".to_string()]));
        assert!(domain_matches_allowlist("example.org", &["example.org".to_string()]));
        assert!(!domain_matches_allowlist("evil.example.com", &["*.gov".to_string(), "example.org".to_string()]));
        assert!(domain_matches_allowlist("anything.at.all", &["*".to_string()]));
    }

    #[test]
    fn annotation_table_lookup() {
        let mut args = HashMap::new();
        args.insert("path".to_string(), vec![ArgumentRole::ReadPath]);
        let tool = ToolAnnotation {
            server_name: "fs".to_string(),
            tool_name: "read_file".to_string(),
            comment: String::new(),
            side_effects: false,
            args,
        };
        let mut servers = HashMap::new();
        servers.insert(
            "fs".to_string(),
            ServerAnnotations {
                input_hash: "h".to_string(),
                tools: vec![tool],
            },
        );
        let table = AnnotationTable::from_servers(servers);
        assert!(table.get("fs", "read_file").is_some());
        assert!(table.get("fs", "missing").is_none());
        assert!(table.roles_in_use().contains(&ArgumentRole::ReadPath));
    }
}
