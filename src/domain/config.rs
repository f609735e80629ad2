// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Runtime configuration (spec §6 "Environment variables"), trimmed from
//! the wider orchestrator's `NodeConfig`/`LLMProviderConfig` manifest to
//! exactly what the Policy Enforcement Core needs: no workflow/container
//! config (that belongs to the out-of-scope wider orchestrator), just the
//! sandbox boundary, the audit log path, the escalation directory/timeout,
//! and an optional single auto-approver provider.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_ESCALATION_TIMEOUT_SECONDS: u64 = 300;
const MIN_ESCALATION_TIMEOUT_SECONDS: u64 = 30;
const MAX_ESCALATION_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_ADD_ROOT_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is required but not set")]
    MissingRequired(&'static str),
    #[error("environment variable {name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// One configured auto-approver provider (spec §4.3). Mirrors the shape of
/// the teacher's `LLMProviderConfig` but trimmed to a single provider: this
/// core needs exactly one optional approver model, not an alias table with
/// fallback/retry strategies (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct AutoApproverConfig {
    pub provider: AutoApproverProvider,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoApproverProvider {
    Anthropic,
    OpenAi,
    Ollama,
}

/// Environment-sourced runtime configuration (spec §6). Env vars override
/// programmatic defaults; this type is constructed once at startup and
/// held read-only thereafter.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// The agent-writable working directory (`ALLOWED_DIRECTORY`).
    pub sandbox_dir: PathBuf,
    /// Where the audit log is appended (`AUDIT_LOG_PATH`).
    pub audit_log_path: PathBuf,
    /// Directories/files that no allow decision may ever touch, beyond the
    /// audit log itself (always included).
    pub protected_paths: Vec<PathBuf>,
    /// Directory used for the file-based escalation request/response pairs.
    pub escalation_dir: PathBuf,
    /// Bounded 30-600s, default 300 (spec §4.3).
    pub escalation_timeout: Duration,
    /// Bounded wait for a backend to acknowledge a root addition (spec
    /// §4.5), default 1s.
    pub add_root_timeout: Duration,
    /// Whether deep redaction of audit entries is enabled (spec §4.4).
    pub audit_redaction_enabled: bool,
    /// Optional auto-approver model, consulted before escalating to a
    /// human (spec §4.3). `None` disables the auto-approval layer.
    pub auto_approver: Option<AutoApproverConfig>,
}

impl RuntimeConfig {
    /// Build from the process environment. Fails closed: a missing
    /// required variable is a startup (not per-request) error, returned
    /// here as a typed `ConfigError` for the caller to report per spec
    /// §7 ("Configuration errors... surfaced at startup, process exits
    /// non-zero").
    pub fn from_env() -> Result<Self, ConfigError> {
        let sandbox_dir = require_env("ALLOWED_DIRECTORY").map(PathBuf::from)?;
        let audit_log_path = require_env("AUDIT_LOG_PATH").map(PathBuf::from)?;

        let mut protected_paths: Vec<PathBuf> = vec![audit_log_path.clone()];
        if let Ok(extra) = std::env::var("IRONCURTAIN_PROTECTED_PATHS") {
            protected_paths.extend(extra.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));
        }

        let escalation_dir = std::env::var("IRONCURTAIN_ESCALATION_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| sandbox_dir.join(".ironcurtain/escalations"));

        let escalation_timeout = parse_escalation_timeout()?;

        let add_root_timeout = std::env::var("IRONCURTAIN_ADD_ROOT_TIMEOUT_MS")
            .ok()
            .map(|v| parse_u64("IRONCURTAIN_ADD_ROOT_TIMEOUT_MS", &v))
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_ADD_ROOT_TIMEOUT_MS));

        let audit_redaction_enabled = bool_env("IRONCURTAIN_AUDIT_REDACTION", true)?;

        let auto_approver = build_auto_approver_config()?;

        Ok(Self {
            sandbox_dir,
            audit_log_path,
            protected_paths,
            escalation_dir,
            escalation_timeout,
            add_root_timeout,
            audit_redaction_enabled,
            auto_approver,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingRequired(name))
}

fn parse_u64(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|e| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn bool_env(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                name,
                value: other.to_string(),
                reason: "expected a boolean (true/false/1/0/yes/no)".to_string(),
            }),
        },
    }
}

fn parse_escalation_timeout() -> Result<Duration, ConfigError> {
    let seconds = match std::env::var("IRONCURTAIN_ESCALATION_TIMEOUT_SECONDS") {
        Err(_) => DEFAULT_ESCALATION_TIMEOUT_SECONDS,
        Ok(v) => parse_u64("IRONCURTAIN_ESCALATION_TIMEOUT_SECONDS", &v)?,
    };
    let bounded = seconds.clamp(MIN_ESCALATION_TIMEOUT_SECONDS, MAX_ESCALATION_TIMEOUT_SECONDS);
    Ok(Duration::from_secs(bounded))
}

fn build_auto_approver_config() -> Result<Option<AutoApproverConfig>, ConfigError> {
    let Ok(provider_name) = std::env::var("IRONCURTAIN_AUTO_APPROVER_PROVIDER") else {
        return Ok(None);
    };
    let provider = match provider_name.as_str() {
        "anthropic" => AutoApproverProvider::Anthropic,
        "openai" => AutoApproverProvider::OpenAi,
        "ollama" => AutoApproverProvider::Ollama,
        other => {
            return Err(ConfigError::Invalid {
                name: "IRONCURTAIN_AUTO_APPROVER_PROVIDER",
                value: other.to_string(),
                reason: "expected one of anthropic, openai, ollama".to_string(),
            })
        }
    };
    let model = std::env::var("IRONCURTAIN_AUTO_APPROVER_MODEL").unwrap_or_else(|_| match provider {
        AutoApproverProvider::Anthropic => "claude-3-5-haiku-latest".to_string(),
        AutoApproverProvider::OpenAi => "gpt-4o-mini".to_string(),
        AutoApproverProvider::Ollama => "llama3.2".to_string(),
    });
    // Standard provider env vars override config values (spec §6); ollama
    // is typically unauthenticated (local daemon).
    let api_key = match provider {
        AutoApproverProvider::Anthropic => std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
        AutoApproverProvider::OpenAi => std::env::var("OPENAI_API_KEY").unwrap_or_default(),
        AutoApproverProvider::Ollama => String::new(),
    };
    Ok(Some(AutoApproverConfig {
        provider,
        api_key,
        model,
    }))
}
