// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Property-based tests for the universal invariants spec.md §8 calls out
//! (I1, I4, I5, I7, I9): quantify over randomly generated paths, rule
//! orderings, and redaction inputs rather than a fixed set of examples.
//!
//! Run with: cargo test --test policy_invariants

use std::collections::HashMap;

use chrono::Utc;
use ironcurtain_core::domain::policy_artifact::{
    AnnotationTable, CompiledPolicy, CompiledRule, Condition, Decision, PolicyArtifacts,
    ServerAnnotations, ServerDomainAllowlist, ToolAnnotation,
};
use ironcurtain_core::domain::policy_engine::{
    self, StructuralConfig, RULE_DEFAULT_DENY, RULE_STRUCTURAL_PROTECTED_PATH,
};
use ironcurtain_core::domain::redaction::redact_string;
use ironcurtain_core::domain::request::{normalize, ToolCallRequest};
use ironcurtain_core::domain::role::{ArgumentRole, RoleRegistry};
use proptest::prelude::*;

fn read_file_annotation() -> ToolAnnotation {
    let mut args = HashMap::new();
    args.insert("path".to_string(), vec![ArgumentRole::ReadPath]);
    ToolAnnotation {
        server_name: "fs".to_string(),
        tool_name: "read_file".to_string(),
        comment: String::new(),
        side_effects: false,
        args,
    }
}

fn artifacts_with(rules: Vec<CompiledRule>, annotation: ToolAnnotation) -> PolicyArtifacts {
    let mut servers = HashMap::new();
    servers.insert(
        annotation.server_name.clone(),
        ServerAnnotations {
            input_hash: "h".to_string(),
            tools: vec![annotation],
        },
    );
    PolicyArtifacts {
        annotations: AnnotationTable::from_servers(servers),
        policy: CompiledPolicy {
            generated_at: Utc::now(),
            constitution_hash: "c".to_string(),
            input_hash: "i".to_string(),
            rules,
        },
        domain_allowlists: ServerDomainAllowlist::default(),
    }
}

fn request_for(path: &str) -> ironcurtain_core::domain::request::NormalizedRequest {
    let annotation = read_file_annotation();
    let mut args = serde_json::Map::new();
    args.insert("path".to_string(), serde_json::json!(path));
    let request = ToolCallRequest::new("fs", "read_file", args, Utc::now());
    normalize(request, &annotation, &RoleRegistry::new()).unwrap()
}

fn tool_level_rule(name: &str, decision: Decision) -> CompiledRule {
    CompiledRule {
        name: name.to_string(),
        description: String::new(),
        principle: String::new(),
        condition: Condition::default(),
        decision,
        reason: "generated".to_string(),
    }
}

fn arbitrary_decision() -> impl Strategy<Value = Decision> {
    prop_oneof![
        Just(Decision::Allow),
        Just(Decision::Escalate),
        Just(Decision::Deny),
    ]
}

/// A path-like segment with no `/`, `..`, or NUL so it is always a legal
/// single path component once prefixed under a temp directory.
fn path_segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,12}"
}

proptest! {
    /// I1: any path textually or canonically inside a protected directory
    /// denies via `structural-protected-path`, regardless of how deep the
    /// relative suffix is.
    #[test]
    fn i1_any_descendant_of_a_protected_dir_denies(
        protected_name in path_segment(),
        descendant_segments in prop::collection::vec(path_segment(), 0..4),
    ) {
        let base = tempfile::tempdir().unwrap();
        let protected = base.path().join(&protected_name);
        std::fs::create_dir_all(&protected).unwrap();

        let mut target = protected.clone();
        for segment in &descendant_segments {
            target.push(segment);
        }
        // The leaf need not exist; canonicalization falls back to
        // resolving the existing ancestor and rejoining (domain::role).
        // When there are no descendant segments, `target == protected`,
        // which already exists as a directory.

        let normalized = request_for(target.to_str().unwrap());
        let config = StructuralConfig {
            sandbox_dir: base.path().to_string_lossy().into_owned(),
            protected_paths: vec![protected.canonicalize().unwrap().to_string_lossy().into_owned()],
        };
        let artifacts = artifacts_with(vec![], read_file_annotation());
        let result = policy_engine::evaluate(&normalized, &artifacts, &config);

        prop_assert_eq!(result.decision, Decision::Deny);
        prop_assert_eq!(result.rule_name, RULE_STRUCTURAL_PROTECTED_PATH);
    }

    /// I5: for any pair of tool-level rules with distinct decisions, the
    /// evaluator always picks whichever rule is declared first.
    #[test]
    fn i5_first_matching_rule_wins_regardless_of_decision_values(
        first in arbitrary_decision(),
        second in arbitrary_decision(),
    ) {
        prop_assume!(first != second);

        let rule_a = tool_level_rule("rule-a", first);
        let rule_b = tool_level_rule("rule-b", second);

        let normalized = request_for("/definitely/outside/the/sandbox");
        let config = StructuralConfig {
            sandbox_dir: "/sandbox".to_string(),
            protected_paths: vec![],
        };

        let artifacts = artifacts_with(vec![rule_a.clone(), rule_b.clone()], read_file_annotation());
        let result = policy_engine::evaluate(&normalized, &artifacts, &config);
        prop_assert_eq!(result.decision, first);
        prop_assert_eq!(result.rule_name, "rule-a".to_string());
    }

    /// I9: with no compiled rules at all, every role that escapes Phase 1
    /// bottoms out at `default-deny` — never silently allows.
    #[test]
    fn i9_no_rules_always_default_denies(
        path in path_segment(),
    ) {
        let normalized = request_for(&format!("/outside-sandbox/{path}"));
        let config = StructuralConfig {
            sandbox_dir: "/sandbox".to_string(),
            protected_paths: vec![],
        };
        let artifacts = artifacts_with(vec![], read_file_annotation());
        let result = policy_engine::evaluate(&normalized, &artifacts, &config);
        prop_assert_eq!(result.decision, Decision::Deny);
        prop_assert_eq!(result.rule_name, RULE_DEFAULT_DENY);
    }

    /// I7: redaction never leaves a Luhn-valid card number or an API-key
    /// prefix in the output, and redacting twice is a no-op (idempotent).
    #[test]
    fn i7_redaction_of_known_card_prefixes_is_idempotent_and_removes_the_secret(
        digits in prop::collection::vec(0_u8..10, 13..20),
        prefix_idx in 0_usize..5,
        suffix in "[a-zA-Z0-9]{0,8}",
    ) {
        const PREFIXES: [&str; 5] = ["sk-", "ghp_", "xoxb-", "xoxp-", "AKIA"];
        let prefix = PREFIXES[prefix_idx];
        let card: String = digits.iter().map(|d| d.to_string()).collect();
        let input = format!("{prefix}{suffix} card {card}");

        let once = redact_string(&input);
        let twice = redact_string(&once);
        prop_assert_eq!(&once, &twice, "redaction must be idempotent");
        prop_assert!(!once.contains(&format!("{prefix}{suffix}")));
    }

    /// I4 (supporting property): most-restrictive-wins aggregation over an
    /// arbitrary sequence of decisions always equals the single worst
    /// decision present, independent of order.
    #[test]
    fn i4_most_restrictive_aggregation_is_order_independent(
        mut decisions in prop::collection::vec(arbitrary_decision(), 1..8),
    ) {
        let forward = decisions
            .iter()
            .copied()
            .reduce(|a, b| a.most_restrictive(b))
            .unwrap();

        decisions.reverse();
        let backward = decisions
            .iter()
            .copied()
            .reduce(|a, b| a.most_restrictive(b))
            .unwrap();

        prop_assert_eq!(forward, backward);
        prop_assert_eq!(forward, *decisions.iter().max().unwrap());
    }
}
