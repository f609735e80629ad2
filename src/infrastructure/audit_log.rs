// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Append-only JSONL audit writer (spec §4.4). Single-writer, `O_APPEND`
//! semantics, flushed before every call returns. Redaction is a pure
//! post-processing pass over the serialized entry (domain::redaction),
//! never interleaved into the orchestrator (design note §9).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::audit::AuditEntry;
use crate::domain::redaction::redact_value;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("failed to create audit log parent directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write audit entry: {0}")]
    Write(#[source] std::io::Error),
}

/// Append-only JSONL writer. Cheap to clone (`Arc`-backed); every clone
/// writes to the same underlying file descriptor.
#[derive(Clone)]
pub struct AuditLog {
    file: Arc<Mutex<std::fs::File>>,
    redact: bool,
}

impl AuditLog {
    /// Open (creating if missing) the audit log at `path` with `O_APPEND`
    /// semantics, creating its parent directory with restrictive
    /// permissions if missing (spec §4.4).
    pub fn open(path: &Path, redact: bool) -> Result<Self, AuditLogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_restricted_dir(parent)?;
            }
        }

        let file = open_append(path)?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            redact,
        })
    }

    /// Append one entry. Best-effort durability per spec §7: a failure is
    /// logged to stderr via `tracing::error!` but never propagated as a
    /// reason to deny or drop the already-decided request (the
    /// alternative — failing closed on log errors — is itself a DoS
    /// vector). Callers that need strict non-repudiation can alert on the
    /// emitted `tracing::error!` externally.
    pub fn append(&self, entry: &AuditEntry) {
        if let Err(err) = self.try_append(entry) {
            tracing::error!(error = %err, request_id = %entry.request_id, "failed to write audit entry");
        }
    }

    fn try_append(&self, entry: &AuditEntry) -> Result<(), AuditLogError> {
        let mut value = serde_json::to_value(entry)?;
        if self.redact {
            redact_value(&mut value);
        }
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');

        let mut file = self.file.lock();
        file.write_all(line.as_bytes()).map_err(AuditLogError::Write)?;
        file.flush().map_err(AuditLogError::Write)?;
        Ok(())
    }

    /// Idempotent: flushes one last time. Safe to call more than once.
    pub fn close(&self) {
        let mut file = self.file.lock();
        let _ = file.flush();
    }
}

#[cfg(unix)]
fn create_restricted_dir(path: &Path) -> Result<(), AuditLogError> {
    use std::os::unix::fs::DirBuilderExt;
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(path).or_else(|e| {
        if path.is_dir() {
            Ok(())
        } else {
            Err(AuditLogError::CreateDir {
                path: path.display().to_string(),
                source: e,
            })
        }
    })
}

#[cfg(not(unix))]
fn create_restricted_dir(path: &Path) -> Result<(), AuditLogError> {
    std::fs::create_dir_all(path).map_err(|source| AuditLogError::CreateDir {
        path: path.display().to_string(),
        source,
    })
}

fn open_append(path: &Path) -> Result<std::fs::File, AuditLogError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| AuditLogError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Read back every complete JSON line in an audit log, tolerating a
/// partially-written final line left by a crash mid-write (spec §4.4).
pub fn read_entries(path: &Path) -> std::io::Result<Vec<AuditEntry>> {
    let contents = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    let lines: Vec<&str> = contents.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) if idx == lines.len() - 1 => {
                // Tolerate a torn last line (crash mid-write).
            }
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }
    Ok(entries)
}

pub fn default_audit_log_path() -> PathBuf {
    PathBuf::from("audit.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::{AuditResult, ResultStatus};
    use crate::domain::policy_artifact::Decision;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_entry() -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            request_id: Uuid::new_v4(),
            server_name: "fs".to_string(),
            tool_name: "read_file".to_string(),
            arguments: serde_json::json!({"path": "/sandbox/a.txt", "token": "sk-abc123"}),
            policy_decision: Decision::Allow,
            rule_name: "structural-sandbox-allow".to_string(),
            reason: "within sandbox".to_string(),
            escalation_result: None,
            auto_approved: None,
            result: AuditResult::success(Some("contents".to_string())),
            duration_ms: 2,
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path, false).unwrap();
        let entry = sample_entry();
        log.append(&entry);
        log.close();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request_id, entry.request_id);
    }

    #[test]
    fn redaction_rewrites_sensitive_strings_but_keeps_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path, true).unwrap();
        log.append(&sample_entry());
        log.close();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-abc123"));
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries[0].result.status, ResultStatus::Success);
    }

    #[test]
    fn open_creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested/sub/audit.jsonl");
        let log = AuditLog::open(&nested, false).unwrap();
        log.append(&sample_entry());
        assert!(nested.exists());
    }

    #[test]
    fn read_entries_tolerates_torn_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut contents = serde_json::to_string(&sample_entry()).unwrap();
        contents.push('\n');
        contents.push_str("{\"incomplete\": tr");
        std::fs::write(&path, contents).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
