// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Loads the three static policy artifacts the (out-of-scope) compilation
//! pipeline produces (spec §2, §6) and performs the startup freshness
//! check. Nothing here is read more than once; the process treats the
//! result as immutable thereafter (spec §3 "Lifecycle").

use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::policy_artifact::{
    AnnotationTable, CompiledPolicy, PolicyArtifacts, ServerAnnotations, ServerDomainAllowlist,
};
use crate::domain::role::{RoleError, RoleRegistry};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path} as JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("role registry completeness check failed: {0}")]
    IncompleteRoleRegistry(#[from] RoleError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolAnnotationsArtifact {
    #[allow(dead_code)]
    generated_at: Option<chrono::DateTime<chrono::Utc>>,
    servers: std::collections::HashMap<String, ServerAnnotations>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LoaderError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| LoaderError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load all three artifacts from disk and run the role registry's
/// compile-time completeness assertion (spec §4.1) over every role value
/// actually present in the loaded annotations.
pub fn load_artifacts(
    annotations_path: &Path,
    policy_path: &Path,
    domain_allowlists_path: &Path,
    registry: &RoleRegistry,
) -> Result<PolicyArtifacts, LoaderError> {
    let annotations_artifact: ToolAnnotationsArtifact = read_json(annotations_path)?;
    let annotations = AnnotationTable::from_servers(annotations_artifact.servers);

    let policy: CompiledPolicy = read_json(policy_path)?;

    let domain_allowlists: ServerDomainAllowlist = if domain_allowlists_path.exists() {
        read_json(domain_allowlists_path)?
    } else {
        ServerDomainAllowlist::default()
    };

    registry.assert_complete(&annotations.roles_in_use())?;

    Ok(PolicyArtifacts {
        annotations,
        policy,
        domain_allowlists,
    })
}

/// Compute the SHA-256 of `base_constitution || user_overlay` (spec §6
/// "Freshness check"). `user_overlay` is empty when no override file is
/// present.
pub fn compute_constitution_hash(base_constitution: &str, user_overlay: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_constitution.as_bytes());
    hasher.update(user_overlay.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare the freshly computed constitution hash against the artifact's
/// recorded one. A mismatch is a warning, never an abort (spec §6).
pub fn check_freshness(policy: &CompiledPolicy, base_constitution: &str, user_overlay: &str) {
    let computed = compute_constitution_hash(base_constitution, user_overlay);
    if computed != policy.constitution_hash {
        tracing::warn!(
            expected = %policy.constitution_hash,
            computed = %computed,
            "compiled policy's constitution hash does not match the current constitution source; \
             the policy may be stale"
        );
    }
}
