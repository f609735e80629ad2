// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! File-based escalation IPC (spec §4.3, §6, §9): durable, restartable
//! human-in-the-loop approval. The escalation directory is the source of
//! truth, modeled as the state machine spec §9 describes — `{no-files,
//! request-present, response-present}`, each transition an atomic rename —
//! so a restarted listener process picks up in-flight requests without
//! this process's cooperation.
//!
//! The in-memory pending table (`DashMap<Uuid, oneshot::Sender<..>>`) is
//! grounded in the teacher's
//! `infrastructure::human_input_service::HumanInputService`, generalized
//! from a purely in-memory approve/reject channel to a durable file-backed
//! one: it is only a liveness optimization so a live process doesn't have
//! to poll its own writes, never the source of truth.

pub mod auto_approver;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify_debouncer_full::notify::{RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::domain::escalation::{
    ApprovalSource, EscalationDecision, EscalationOutcome, EscalationRecord, EscalationRequestFile,
    EscalationResponseFile,
};

pub use auto_approver::{AutoApprover, AutoApproverVerdict};

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("failed to create escalation directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to watch escalation directory {path}: {source}")]
    Watch {
        path: String,
        #[source]
        source: notify_debouncer_full::notify::Error,
    },
}

fn request_file_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("request-{id}.json"))
}

fn response_file_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("response-{id}.json"))
}

/// Write `contents` to `path` via temp-file-then-rename so a concurrent
/// reader never observes a partially written file (spec §4.3, §6).
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_name = format!(".{}.tmp-{}", path.file_name().unwrap().to_string_lossy(), Uuid::new_v4());
    let tmp_path = dir.join(tmp_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Durable, restartable escalation handler.
pub struct EscalationHandler {
    dir: PathBuf,
    timeout: Duration,
    pending: Arc<DashMap<Uuid, oneshot::Sender<EscalationResponseFile>>>,
    auto_approver: Option<AutoApprover>,
    // Kept alive for the lifetime of the handler; dropping it stops the
    // watch. The debounced event stream is bridged into `pending` by the
    // background task spawned in `new`.
    _debouncer:
        notify_debouncer_full::Debouncer<notify_debouncer_full::notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>,
}

impl EscalationHandler {
    pub fn new(dir: PathBuf, timeout: Duration, auto_approver: Option<AutoApprover>) -> Result<Self, EscalationError> {
        std::fs::create_dir_all(&dir).map_err(|source| EscalationError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;

        let pending: Arc<DashMap<Uuid, oneshot::Sender<EscalationResponseFile>>> = Arc::new(DashMap::new());
        let pending_for_watcher = pending.clone();
        let watch_dir = dir.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(150),
            None,
            move |result: DebounceEventResult| {
                let Ok(events) = result else { return };
                for event in events {
                    for path in &event.paths {
                        if let Some(id) = extract_response_id(path) {
                            if let Some((_, tx)) = pending_for_watcher.remove(&id) {
                                if let Ok(contents) = std::fs::read_to_string(path) {
                                    if let Ok(response) = serde_json::from_str::<EscalationResponseFile>(&contents) {
                                        let _ = tx.send(response);
                                    }
                                }
                            }
                        }
                    }
                }
            },
        )
        .map_err(|source| EscalationError::Watch {
            path: dir.display().to_string(),
            source,
        })?;

        debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|source| EscalationError::Watch {
                path: dir.display().to_string(),
                source,
            })?;

        Ok(Self {
            dir,
            timeout,
            pending,
            auto_approver,
            _debouncer: debouncer,
        })
    }

    /// Try the optional auto-approver, then (if not approved) write a
    /// durable request and block until a response arrives, the timeout
    /// elapses, or the request file is externally deleted with no
    /// response (expired).
    pub async fn prompt(
        &self,
        record: &EscalationRecord,
        server_context: &str,
        user_message: Option<&str>,
        resolved_identifiers: &[&crate::domain::request::ExtractedValue],
    ) -> EscalationOutcome {
        if let Some(approver) = &self.auto_approver {
            let verdict = approver
                .evaluate(
                    user_message,
                    &record.request.tool_name,
                    server_context,
                    &record.reason,
                    resolved_identifiers,
                )
                .await;
            if verdict == AutoApproverVerdict::Approve {
                return EscalationOutcome {
                    decision: EscalationDecision::Approved,
                    source: ApprovalSource::AutoApprover,
                };
            }
        }

        self.prompt_human(record).await
    }

    async fn prompt_human(&self, record: &EscalationRecord) -> EscalationOutcome {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(record.escalation_id, tx);

        let request_path = request_file_path(&self.dir, record.escalation_id);
        let request_file = EscalationRequestFile::from(record);
        let body = match serde_json::to_vec_pretty(&request_file) {
            Ok(b) => b,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize escalation request");
                self.pending.remove(&record.escalation_id);
                return EscalationOutcome {
                    decision: EscalationDecision::Denied,
                    source: ApprovalSource::Timeout,
                };
            }
        };
        if let Err(err) = write_atomic(&request_path, &body) {
            tracing::error!(error = %err, "failed to write escalation request file");
            self.pending.remove(&record.escalation_id);
            return EscalationOutcome {
                decision: EscalationDecision::Denied,
                source: ApprovalSource::Timeout,
            };
        }

        let escalation_id = record.escalation_id;
        let dir = self.dir.clone();

        let result = tokio::select! {
            response = rx => {
                cleanup(&dir, escalation_id);
                match response {
                    Ok(response_file) => EscalationOutcome { decision: response_file.decision, source: ApprovalSource::Human },
                    Err(_) => EscalationOutcome { decision: EscalationDecision::Denied, source: ApprovalSource::Timeout },
                }
            }
            _ = self.wait_for_expiry_or_timeout(escalation_id) => {
                self.pending.remove(&escalation_id);
                cleanup(&dir, escalation_id);
                EscalationOutcome { decision: EscalationDecision::Denied, source: ApprovalSource::Timeout }
            }
        };

        result
    }

    /// Polling fallback + liveness probe (design note §9): wakes at the
    /// configured timeout, or earlier if the request file disappears
    /// externally with no response present ("expired", spec §4.3
    /// Cancellation).
    async fn wait_for_expiry_or_timeout(&self, escalation_id: Uuid) {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let request_path = request_file_path(&self.dir, escalation_id);
        let response_path = response_file_path(&self.dir, escalation_id);
        let mut poll = tokio::time::interval(Duration::from_millis(250));

        loop {
            poll.tick().await;
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            if !request_path.exists() && !response_path.exists() {
                // Externally cancelled: no response ever arrived.
                return;
            }
        }
    }
}

fn cleanup(dir: &Path, escalation_id: Uuid) {
    let _ = std::fs::remove_file(request_file_path(dir, escalation_id));
    let _ = std::fs::remove_file(response_file_path(dir, escalation_id));
}

fn extract_response_id(path: &Path) -> Option<Uuid> {
    let stem = path.file_stem()?.to_str()?;
    let id_str = stem.strip_prefix("response-")?;
    Uuid::parse_str(id_str).ok()
}

/// Write a response file as the (external) approval listener would,
/// exercised by tests and usable by an out-of-process responder built
/// against this crate's types.
pub fn write_response(dir: &Path, escalation_id: Uuid, decision: EscalationDecision) -> std::io::Result<()> {
    let response = EscalationResponseFile { decision };
    let body = serde_json::to_vec_pretty(&response)?;
    write_atomic(&response_file_path(dir, escalation_id), &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::ToolCallRequest;
    use chrono::Utc;

    fn make_record(timeout_secs: i64) -> EscalationRecord {
        let request = ToolCallRequest::new("fs", "read_file", serde_json::Map::new(), Utc::now());
        EscalationRecord::new(request, "outside sandbox", chrono::Duration::seconds(timeout_secs))
    }

    #[tokio::test]
    async fn approved_response_file_resolves_the_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let handler = EscalationHandler::new(dir.path().to_path_buf(), Duration::from_secs(5), None).unwrap();
        let record = make_record(5);
        let escalation_id = record.escalation_id;
        let dir_path = dir.path().to_path_buf();

        let responder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            write_response(&dir_path, escalation_id, EscalationDecision::Approved).unwrap();
        });

        let outcome = handler.prompt(&record, "fs", None, &[]).await;
        responder.await.unwrap();
        assert_eq!(outcome.decision, EscalationDecision::Approved);
        assert_eq!(outcome.source, ApprovalSource::Human);
    }

    #[tokio::test]
    async fn timeout_denies_and_cleans_up_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = EscalationHandler::new(dir.path().to_path_buf(), Duration::from_millis(300), None).unwrap();
        let record = make_record(0);

        let outcome = handler.prompt(&record, "fs", None, &[]).await;
        assert_eq!(outcome.decision, EscalationDecision::Denied);
        assert_eq!(outcome.source, ApprovalSource::Timeout);
        assert!(!request_file_path(dir.path(), record.escalation_id).exists());
    }

    #[tokio::test]
    async fn externally_deleted_request_is_treated_as_expired() {
        let dir = tempfile::tempdir().unwrap();
        let handler = EscalationHandler::new(dir.path().to_path_buf(), Duration::from_secs(5), None).unwrap();
        let record = make_record(5);
        let escalation_id = record.escalation_id;
        let dir_path = dir.path().to_path_buf();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = std::fs::remove_file(request_file_path(&dir_path, escalation_id));
        });

        let outcome = handler.prompt(&record, "fs", None, &[]).await;
        canceller.await.unwrap();
        assert_eq!(outcome.decision, EscalationDecision::Denied);
    }
}
