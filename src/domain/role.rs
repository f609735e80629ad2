// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Argument-Role Registry (spec §4.1)
//!
//! Gives every tool-call argument a typed semantic role and the
//! canonicalization that policy evaluation requires. Symlink resolution is
//! mandatory here (not a lexical-only normalization) because Phase 1 sandbox
//! containment (`domain::policy_engine`) must be TOCTOU-resistant: a string
//! that merely *looks* contained can still point outside the sandbox through
//! a symlink, and policy decisions must be made on the canonical target.
//!
//! Grounded on `domain::path_sanitizer::PathSanitizer` from the wider
//! orchestrator this crate was extracted from: same posture (bounded work,
//! fail closed, never silently accept an unresolvable path), generalized
//! from lexical-only traversal rejection to real `realpath`-style resolution.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use once_cell_like::OnceLock;
use thiserror::Error;

/// How deep the registry will walk a chain of missing ancestors (or
/// symlinks) while canonicalizing a path, before giving up. Bounds
/// pathological symlink graphs (spec §4.1).
pub const MAX_CANONICALIZATION_DEPTH: usize = 64;

/// Semantic classification of a tool-call argument value.
///
/// `Custom` carries a tag for roles the deployment's constitution-compiler
/// introduced beyond the built-ins; those must still be registered (see
/// [`RoleRegistry::register`]) or the registry's completeness assertion
/// fails at startup (spec §4.1: "unknown -> error at startup").
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentRole {
    ReadPath,
    WritePath,
    DeletePath,
    FetchUrl,
    CommitMessage,
    BranchName,
    None,
    #[serde(untagged)]
    Custom(String),
}

impl ArgumentRole {
    /// Roles eligible for Phase-1 sandbox auto-allow (spec §3).
    pub fn is_sandbox_safe_path_role(&self) -> bool {
        matches!(self, Self::ReadPath | Self::WritePath | Self::DeletePath)
    }

    pub fn is_path_role(&self) -> bool {
        matches!(self, Self::ReadPath | Self::WritePath | Self::DeletePath)
    }

    pub fn is_url_role(&self) -> bool {
        matches!(self, Self::FetchUrl)
    }

    /// Whether this role's value identifies a resource (path/URL) as
    /// opposed to opaque text (commit messages, branch names, `None`).
    pub fn is_resource_identifier(&self) -> bool {
        self.is_path_role() || self.is_url_role()
    }
}

impl std::fmt::Display for ArgumentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadPath => write!(f, "read-path"),
            Self::WritePath => write!(f, "write-path"),
            Self::DeletePath => write!(f, "delete-path"),
            Self::FetchUrl => write!(f, "fetch-url"),
            Self::CommitMessage => write!(f, "commit-message"),
            Self::BranchName => write!(f, "branch-name"),
            Self::None => write!(f, "none"),
            Self::Custom(tag) => write!(f, "{tag}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("argument role '{0}' has no registered definition")]
    UnknownRole(String),
    #[error("path canonicalization failed for '{path}': {reason}")]
    Canonicalization { path: String, reason: String },
}

/// A semantic description of one role: what it means, and how to
/// canonicalize a raw argument value carrying it.
pub struct RoleDefinition {
    pub role: ArgumentRole,
    pub description: &'static str,
    pub is_resource_identifier: bool,
    normalize_fn: fn(&str) -> Result<String, RoleError>,
    resolve_for_policy_fn: Option<fn(&str, &serde_json::Map<String, serde_json::Value>) -> String>,
    prepare_for_policy_fn: Option<fn(&str) -> String>,
}

impl RoleDefinition {
    /// Expand `~`, resolve symlinks, rejoin a missing leaf onto its
    /// resolved parent. Never panics; a failure degrades to absolute-resolve.
    pub fn normalize(&self, value: &str) -> Result<String, RoleError> {
        (self.normalize_fn)(value)
    }

    /// For URL roles: map a named remote to a concrete URL using sibling
    /// arguments (e.g. git's `remote` -> the `url` arg of the same call).
    pub fn resolve_for_policy(
        &self,
        value: &str,
        all_args: &serde_json::Map<String, serde_json::Value>,
    ) -> String {
        match self.resolve_for_policy_fn {
            Some(f) => f(value, all_args),
            None => value.to_string(),
        }
    }

    /// For URL roles: extract the bare domain for allowlist comparison.
    pub fn prepare_for_policy(&self, value: &str) -> String {
        match self.prepare_for_policy_fn {
            Some(f) => f(value),
            None => value.to_string(),
        }
    }
}

fn identity_normalize(value: &str) -> Result<String, RoleError> {
    Ok(value.to_string())
}

/// Expand `~`, then resolve symlinks with a bounded depth, falling back to
/// an absolute lexical resolution if any step fails. This is the one and
/// only place path canonicalization happens (design note: "never call from
/// multiple places with subtly different contracts").
pub fn canonicalize_path(value: &str) -> Result<String, RoleError> {
    let expanded = expand_tilde(value);
    let path = Path::new(&expanded);

    match resolve_symlinks(path, MAX_CANONICALIZATION_DEPTH) {
        Ok(resolved) => Ok(resolved.to_string_lossy().into_owned()),
        Err(_) => Ok(absolute_lexical(path).to_string_lossy().into_owned()),
    }
}

fn expand_tilde(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(value)
}

/// Resolve symlinks along `path`. If the full path exists, delegate to
/// `std::fs::canonicalize`. Otherwise resolve the deepest existing ancestor
/// and rejoin the remaining (non-existent) components lexically -- this
/// lets policy reason about paths that will be *created* by the call (e.g.
/// `write_file` to a not-yet-existent file).
fn resolve_symlinks(path: &Path, max_depth: usize) -> std::io::Result<PathBuf> {
    let absolute = absolute_lexical(path);

    if let Ok(canon) = std::fs::canonicalize(&absolute) {
        return Ok(canon);
    }

    // Walk up until we find an ancestor that exists, bounded by max_depth.
    let mut missing_tail: Vec<std::ffi::OsString> = Vec::new();
    let mut current = absolute.clone();
    let mut depth = 0;

    loop {
        if depth >= max_depth {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "canonicalization depth limit exceeded",
            ));
        }
        if current.as_os_str().is_empty() || current == Path::new("/") {
            break;
        }
        match std::fs::canonicalize(&current) {
            Ok(canon) => {
                let mut result = canon;
                for component in missing_tail.iter().rev() {
                    result.push(component);
                }
                return Ok(result);
            }
            Err(_) => {
                let file_name = current.file_name().map(|s| s.to_os_string());
                if let Some(name) = file_name {
                    missing_tail.push(name);
                }
                current = match current.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => break,
                };
            }
        }
        depth += 1;
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no existing ancestor found",
    ))
}

/// Lexical (non-syscall) absolutization + `.`/`..` normalization. Used both
/// as the final fallback and to seed the symlink walk.
fn absolute_lexical(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn fetch_url_resolve(value: &str, all_args: &serde_json::Map<String, serde_json::Value>) -> String {
    // Named-remote style args (git `fetch`/`push` with a `remote` arg and a
    // sibling `url`) resolve to the concrete URL when present; otherwise the
    // value is already a URL.
    if url::Url::parse(value).is_ok() {
        return value.to_string();
    }
    for key in ["url", "remote_url", "repository_url"] {
        if let Some(sibling) = all_args.get(key).and_then(|v| v.as_str()) {
            if url::Url::parse(sibling).is_ok() {
                return sibling.to_string();
            }
        }
    }
    value.to_string()
}

fn fetch_url_prepare(value: &str) -> String {
    url::Url::parse(value)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Pure table of role semantics. No state beyond an optional set of
/// deployment-registered extension roles (design note §9: "role registry as
/// dispatch table... compile-time completeness check").
pub struct RoleRegistry {
    extensions: HashSet<String>,
}

static BUILTIN_DEFINITIONS: OnceLock<[RoleDefinition; 7]> = OnceLock::new();

fn builtin_definitions() -> &'static [RoleDefinition; 7] {
    BUILTIN_DEFINITIONS.get_or_init(|| {
        [
            RoleDefinition {
                role: ArgumentRole::ReadPath,
                description: "filesystem path the tool will read",
                is_resource_identifier: true,
                normalize_fn: canonicalize_path,
                resolve_for_policy_fn: None,
                prepare_for_policy_fn: None,
            },
            RoleDefinition {
                role: ArgumentRole::WritePath,
                description: "filesystem path the tool will write or create",
                is_resource_identifier: true,
                normalize_fn: canonicalize_path,
                resolve_for_policy_fn: None,
                prepare_for_policy_fn: None,
            },
            RoleDefinition {
                role: ArgumentRole::DeletePath,
                description: "filesystem path the tool will delete",
                is_resource_identifier: true,
                normalize_fn: canonicalize_path,
                resolve_for_policy_fn: None,
                prepare_for_policy_fn: None,
            },
            RoleDefinition {
                role: ArgumentRole::FetchUrl,
                description: "remote URL the tool will contact",
                is_resource_identifier: true,
                normalize_fn: identity_normalize,
                resolve_for_policy_fn: Some(fetch_url_resolve),
                prepare_for_policy_fn: Some(fetch_url_prepare),
            },
            RoleDefinition {
                role: ArgumentRole::CommitMessage,
                description: "free-form commit message text",
                is_resource_identifier: false,
                normalize_fn: identity_normalize,
                resolve_for_policy_fn: None,
                prepare_for_policy_fn: None,
            },
            RoleDefinition {
                role: ArgumentRole::BranchName,
                description: "VCS branch or ref name",
                is_resource_identifier: false,
                normalize_fn: identity_normalize,
                resolve_for_policy_fn: None,
                prepare_for_policy_fn: None,
            },
            RoleDefinition {
                role: ArgumentRole::None,
                description: "opaque argument with no policy-relevant semantics",
                is_resource_identifier: false,
                normalize_fn: identity_normalize,
                resolve_for_policy_fn: None,
                prepare_for_policy_fn: None,
            },
        ]
    })
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self {
            extensions: HashSet::new(),
        }
    }

    /// Register an extension role tag as known-opaque (non-resource). Used
    /// at startup for constitution-specific roles beyond the built-ins.
    pub fn register(&mut self, tag: impl Into<String>) {
        self.extensions.insert(tag.into());
    }

    /// Completeness assertion: every role value has a definition. Called
    /// once at startup (spec §4.1).
    pub fn assert_complete(&self, roles_in_use: &HashSet<ArgumentRole>) -> Result<(), RoleError> {
        for role in roles_in_use {
            self.get_role_definition(role)?;
        }
        Ok(())
    }

    pub fn get_role_definition(&self, role: &ArgumentRole) -> Result<&'static RoleDefinition, RoleError> {
        if let Some(def) = builtin_definitions().iter().find(|d| &d.role == role) {
            return Ok(def);
        }
        if let ArgumentRole::Custom(tag) = role {
            if self.extensions.contains(tag) {
                // Extension roles behave like `None`: opaque, not a
                // resource identifier, identity-normalized.
                return Ok(&builtin_definitions()[6]);
            }
        }
        Err(RoleError::UnknownRole(role.to_string()))
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `SANDBOX_SAFE_PATH_ROLES` (spec §3): the subset of roles eligible for
/// Phase-1 sandbox auto-allow.
pub fn sandbox_safe_path_roles() -> [ArgumentRole; 3] {
    [ArgumentRole::ReadPath, ArgumentRole::WritePath, ArgumentRole::DeletePath]
}

/// Minimal `OnceLock`-shaped helper so this module doesn't reach for the
/// `once_cell` crate just for one static table; kept private to this file.
mod once_cell_like {
    use std::sync::OnceLock as StdOnceLock;

    pub struct OnceLock<T>(StdOnceLock<T>);

    impl<T> OnceLock<T> {
        pub const fn new() -> Self {
            Self(StdOnceLock::new())
        }

        pub fn get_or_init(&self, f: impl FnOnce() -> T) -> &T {
            self.0.get_or_init(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_all_builtin_roles() {
        let registry = RoleRegistry::new();
        for role in [
            ArgumentRole::ReadPath,
            ArgumentRole::WritePath,
            ArgumentRole::DeletePath,
            ArgumentRole::FetchUrl,
            ArgumentRole::CommitMessage,
            ArgumentRole::BranchName,
            ArgumentRole::None,
        ] {
            assert!(registry.get_role_definition(&role).is_ok());
        }
    }

    #[test]
    fn unregistered_custom_role_is_an_error() {
        let registry = RoleRegistry::new();
        let role = ArgumentRole::Custom("exotic-thing".to_string());
        assert!(registry.get_role_definition(&role).is_err());
    }

    #[test]
    fn registered_custom_role_resolves() {
        let mut registry = RoleRegistry::new();
        registry.register("exotic-thing");
        let role = ArgumentRole::Custom("exotic-thing".to_string());
        assert!(registry.get_role_definition(&role).is_ok());
    }

    #[test]
    fn canonicalize_resolves_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hi").unwrap();

        let resolved = canonicalize_path(file.to_str().unwrap()).unwrap();
        assert_eq!(PathBuf::from(resolved), file.canonicalize().unwrap());
    }

    #[test]
    fn canonicalize_handles_nonexistent_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist-yet.txt");

        let resolved = canonicalize_path(missing.to_str().unwrap()).unwrap();
        let expected = dir.path().canonicalize().unwrap().join("does-not-exist-yet.txt");
        assert_eq!(PathBuf::from(resolved), expected);
    }

    #[test]
    fn canonicalize_follows_symlink_out_of_sandbox() {
        let sandbox = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, b"shh").unwrap();

        let link = sandbox.path().join("link.txt");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        #[cfg(unix)]
        {
            let resolved = canonicalize_path(link.to_str().unwrap()).unwrap();
            assert_eq!(PathBuf::from(resolved), secret.canonicalize().unwrap());
            assert!(!resolved.starts_with(sandbox.path().to_str().unwrap()));
        }
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            let resolved = canonicalize_path("~/").unwrap();
            assert!(PathBuf::from(resolved).starts_with(home));
        }
    }

    #[test]
    fn fetch_url_prepare_extracts_bare_domain() {
        assert_eq!(fetch_url_prepare("https://example.org/path?x=1"), "example.org");
    }

    #[test]
    fn fetch_url_resolve_passes_through_concrete_url() {
        let args = serde_json::Map::new();
        assert_eq!(
            fetch_url_resolve("https://example.org/", &args),
            "https://example.org/"
        );
    }

    #[test]
    fn fetch_url_resolve_maps_named_remote_via_sibling_arg() {
        let mut args = serde_json::Map::new();
        args.insert("url".to_string(), serde_json::json!("https://github.com/org/repo.git"));
        assert_eq!(
            fetch_url_resolve("origin", &args),
            "https://github.com/org/repo.git"
        );
    }
}
