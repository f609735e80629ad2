// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # ironcurtain-core
//!
//! The Policy Enforcement Core of IronCurtain: a trusted process that
//! mediates every tool call an autonomous agent issues against a
//! declarative, two-phase policy, coordinates human/LLM escalation, and
//! records an append-only audit trail.
//!
//! ## Layer Structure
//!
//! ```text
//! application/    <- the Trusted Process Orchestrator: wires everything
//!                    below into the per-request pipeline
//!     |
//! domain/         <- pure data + pure logic: role registry, policy
//!                    artifacts, the two-phase policy engine, redaction,
//!                    audit/escalation shapes, config, the LLMProvider ACL
//!     |
//! infrastructure/ <- I/O: artifact loading, the JSONL audit writer, the
//!                    file-based escalation IPC, the backend connection
//!                    manager, LLM provider adapters
//! ```
//!
//! There is no `presentation/` layer: transport wiring (UDS/TCP/stdio
//! framing), the CLI, and containerization are out of scope (see
//! `spec.md` §1 and `SPEC_FULL.md`). Callers reach this crate through
//! [`application::orchestrator::Orchestrator::handle_request`].
//!
//! ## Tests
//!
//! Unit tests live inline per module; `tests/` holds the end-to-end
//! scenarios and property-based invariants from `spec.md` §8.

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::{Orchestrator, OrchestratorError, OrchestratorOutcome};
pub use domain::policy_artifact::Decision;
pub use domain::request::{EvaluationResult, ToolCallRequest};
