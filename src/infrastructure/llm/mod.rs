// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! `LLMProvider` adapters (spec §4.3's optional auto-approver). Unlike the
//! wider orchestrator this crate was extracted from, there is no
//! multi-provider alias table here: a deployment configures at most one
//! auto-approver model (see `domain::config::AutoApproverConfig`), so the
//! teacher's `ProviderRegistry` alias-resolution/fallback machinery was not
//! carried over (see DESIGN.md).

pub mod anthropic;
pub mod ollama;
pub mod openai;
