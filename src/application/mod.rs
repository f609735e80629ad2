// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! The Trusted Process Orchestrator: the only layer that wires domain
//! logic to infrastructure I/O (spec §4.6).

pub mod orchestrator;

pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorOutcome};
