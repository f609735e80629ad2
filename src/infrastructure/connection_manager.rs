// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Backend Connection Manager (spec §4.5): one persistent client per
//! backend tool server, with dynamic "roots" (permitted directories)
//! expansion on escalation approval.
//!
//! Grounded on the teacher's `infrastructure::tool_router::ToolRouter`
//! (per-server map behind a lock, non-fatal per-server connect failures)
//! but generalized to this spec's actual contract: `listTools`/
//! `callTool`/`addRoot` against a `BackendClient` trait object, with the
//! roots protocol the teacher's router has no concept of (new surface,
//! grounded directly in spec §4.5/§6; see DESIGN.md).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct CallToolOutcome {
    pub is_error: bool,
    pub text: String,
}

/// A permitted directory advertised to a cooperating backend (spec §3
/// `Root`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Root {
    pub uri: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error talking to backend '{server}': {message}")]
    Transport { server: String, message: String },
    #[error("backend '{server}' did not acknowledge root addition within {0:?}", .timeout)]
    AddRootTimeout { server: String, timeout: Duration },
}

/// What a backend tool server exposes to this trusted process. One
/// implementation per wire protocol (stdio/UDS/TCP framing is out of
/// scope here — spec §1); this crate only consumes the trait.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BackendError>;
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolOutcome, BackendError>;
    /// Notify the backend of a newly added root and wait for it to
    /// acknowledge (refresh its own view), bounded by the manager's
    /// `add_root_timeout`.
    async fn notify_root_added(&self, root: &Root) -> Result<(), BackendError>;
}

struct BackendState {
    client: Arc<dyn BackendClient>,
    roots: HashSet<Root>,
}

/// Per-server connection state, addressable by server name. Connect
/// failures at startup are non-fatal per server (spec §4.5): a missing
/// backend makes its tools unavailable, not the whole process.
pub struct ConnectionManager {
    backends: RwLock<HashMap<String, BackendState>>,
    add_root_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(add_root_timeout: Duration) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            add_root_timeout,
        }
    }

    /// Register a connected backend. Called once per server at startup by
    /// whatever (out-of-scope) transport layer established the
    /// connection; a server that failed to connect is simply never
    /// registered, and its tools stay unavailable (spec §4.5).
    pub async fn register(&self, server_name: impl Into<String>, client: Arc<dyn BackendClient>) {
        let mut backends = self.backends.write().await;
        backends.insert(
            server_name.into(),
            BackendState {
                client,
                roots: HashSet::new(),
            },
        );
    }

    pub async fn is_connected(&self, server_name: &str) -> bool {
        self.backends.read().await.contains_key(server_name)
    }

    pub async fn list_tools(&self, server_name: &str) -> Result<Vec<ToolDescriptor>, BackendError> {
        let backends = self.backends.read().await;
        let state = backends.get(server_name).ok_or_else(|| BackendError::Transport {
            server: server_name.to_string(),
            message: "backend not connected".to_string(),
        })?;
        state.client.list_tools().await
    }

    /// Forward the call exactly as produced by argument preparation
    /// (transport args), not the policy-normalized view (spec §4.5).
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolOutcome, BackendError> {
        let client = {
            let backends = self.backends.read().await;
            let state = backends.get(server_name).ok_or_else(|| BackendError::Transport {
                server: server_name.to_string(),
                message: "backend not connected".to_string(),
            })?;
            state.client.clone()
        };
        client.call_tool(tool_name, arguments).await
    }

    /// Add a root for `server_name` if not already present, then notify
    /// the backend and wait (bounded) for its acknowledgement. Set
    /// semantics make this idempotent under a race between two approvals
    /// adding the same directory (spec §5 "Ordering guarantees").
    pub async fn add_root(&self, server_name: &str, root: Root) -> Result<(), BackendError> {
        let (client, already_present) = {
            let mut backends = self.backends.write().await;
            let state = backends.get_mut(server_name).ok_or_else(|| BackendError::Transport {
                server: server_name.to_string(),
                message: "backend not connected".to_string(),
            })?;
            if state.roots.contains(&root) {
                (state.client.clone(), true)
            } else {
                state.roots.insert(root.clone());
                (state.client.clone(), false)
            }
        };

        if already_present {
            return Ok(());
        }

        match tokio::time::timeout(self.add_root_timeout, client.notify_root_added(&root)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    server = server_name,
                    root = %root.uri,
                    "backend did not acknowledge root addition within the bounded wait; \
                     proceeding anyway so a stuck backend cannot wedge the request forever"
                );
                Ok(())
            }
        }
    }

    pub async fn roots_for(&self, server_name: &str) -> HashSet<Root> {
        self.backends
            .read()
            .await
            .get(server_name)
            .map(|s| s.roots.clone())
            .unwrap_or_default()
    }

    /// Close all backends at shutdown (spec §5 "Cancellation semantics").
    /// Connections themselves are owned by the transport layer; this just
    /// drops this manager's references to them.
    pub async fn shutdown(&self) {
        let mut backends = self.backends.write().await;
        backends.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        notify_calls: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl BackendClient for MockBackend {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BackendError> {
            Ok(vec![ToolDescriptor {
                name: "read_file".to_string(),
                description: String::new(),
            }])
        }

        async fn call_tool(
            &self,
            _tool_name: &str,
            _arguments: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<CallToolOutcome, BackendError> {
            Ok(CallToolOutcome {
                is_error: false,
                text: "ok".to_string(),
            })
        }

        async fn notify_root_added(&self, _root: &Root) -> Result<(), BackendError> {
            self.notify_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn unconnected_backend_is_non_fatal_transport_error() {
        let manager = ConnectionManager::new(Duration::from_millis(50));
        let result = manager.list_tools("missing").await;
        assert!(matches!(result, Err(BackendError::Transport { .. })));
    }

    #[tokio::test]
    async fn add_root_is_idempotent_under_duplicate_calls() {
        let manager = ConnectionManager::new(Duration::from_millis(50));
        let backend = Arc::new(MockBackend {
            notify_calls: AtomicUsize::new(0),
            hang: false,
        });
        manager.register("fs", backend.clone()).await;

        let root = Root {
            uri: "file:///sandbox".to_string(),
            name: "sandbox".to_string(),
        };
        manager.add_root("fs", root.clone()).await.unwrap();
        manager.add_root("fs", root.clone()).await.unwrap();

        assert_eq!(backend.notify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.roots_for("fs").await.len(), 1);
    }

    #[tokio::test]
    async fn add_root_does_not_wedge_on_a_stuck_backend() {
        let manager = ConnectionManager::new(Duration::from_millis(20));
        let backend = Arc::new(MockBackend {
            notify_calls: AtomicUsize::new(0),
            hang: true,
        });
        manager.register("fs", backend).await;

        let root = Root {
            uri: "file:///sandbox".to_string(),
            name: "sandbox".to_string(),
        };
        let result = manager.add_root("fs", root).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn call_tool_forwards_transport_arguments() {
        let manager = ConnectionManager::new(Duration::from_millis(50));
        let backend = Arc::new(MockBackend {
            notify_calls: AtomicUsize::new(0),
            hang: false,
        });
        manager.register("fs", backend).await;

        let mut args = serde_json::Map::new();
        args.insert("path".to_string(), serde_json::json!("/sandbox/a.txt"));
        let outcome = manager.call_tool("fs", "read_file", &args).await.unwrap();
        assert!(!outcome.is_error);
    }
}
