// Copyright (c) 2026 IronCurtain Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Optional LLM-based auto-approval layer (spec §4.3), consulted before a
//! human is ever paged. Built on `domain::llm::LLMProvider` behind a
//! strict `{approve, escalate}`-only response parser — the contract the
//! design note calls out explicitly: auto-approval can only ever narrow
//! toward "ask a human", never itself produce a denial or a silent allow
//! of something a human never saw.

use std::sync::Arc;

use crate::domain::llm::{GenerationOptions, LLMProvider};
use crate::domain::request::ExtractedValue;

const MAX_IDENTIFIER_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoApproverVerdict {
    Approve,
    Escalate,
}

pub struct AutoApprover {
    provider: Arc<dyn LLMProvider>,
}

impl AutoApprover {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    /// Ask the model whether to approve. Returns `Escalate` (never an
    /// error) for any malformed/errored model response, an empty
    /// `user_message`, or a model response that isn't exactly `approve`.
    ///
    /// Deployments with no user-message capture should pass `None` — this
    /// is treated identically to an empty string (spec open question #2),
    /// and the design note documents `RuntimeConfig` should be left
    /// without an auto-approver in that case to avoid paying the latency
    /// for a call that always escalates.
    pub async fn evaluate(
        &self,
        user_message: Option<&str>,
        tool_name: &str,
        server_name: &str,
        reason: &str,
        resolved_identifiers: &[&ExtractedValue],
    ) -> AutoApproverVerdict {
        let Some(user_message) = user_message.filter(|m| !m.trim().is_empty()) else {
            return AutoApproverVerdict::Escalate;
        };

        let prompt = build_prompt(user_message, tool_name, server_name, reason, resolved_identifiers);
        let options = GenerationOptions {
            max_tokens: Some(16),
            temperature: Some(0.0),
            stop_sequences: None,
        };

        match self.provider.generate(&prompt, &options).await {
            Ok(response) => parse_verdict(&response.text),
            Err(err) => {
                tracing::warn!(error = %err, "auto-approver call failed; escalating to a human");
                AutoApproverVerdict::Escalate
            }
        }
    }
}

fn build_prompt(
    user_message: &str,
    tool_name: &str,
    server_name: &str,
    reason: &str,
    resolved_identifiers: &[&ExtractedValue],
) -> String {
    let identifiers: Vec<String> = resolved_identifiers
        .iter()
        .map(|v| sanitize_identifier(&v.normalized))
        .collect();

    format!(
        "A user asked an assistant to do the following:\n\"{user}\"\n\n\
         The assistant wants to call tool `{server}/{tool}`, which a security policy has \
         flagged for review: {reason}\n\n\
         Resources involved: {identifiers}\n\n\
         Does this tool call plausibly follow from what the user asked? Respond with exactly \
         one word: \"approve\" or \"escalate\". If you are at all uncertain, respond \"escalate\".",
        user = sanitize_identifier(user_message),
        server = server_name,
        tool = tool_name,
        reason = reason,
        identifiers = if identifiers.is_empty() {
            "(none)".to_string()
        } else {
            identifiers.join(", ")
        },
    )
}

/// Strip control characters and bound length before embedding a value in
/// a model prompt (spec §4.3).
fn sanitize_identifier(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| !c.is_control()).collect();
    if cleaned.chars().count() > MAX_IDENTIFIER_LEN {
        let truncated: String = cleaned.chars().take(MAX_IDENTIFIER_LEN).collect();
        format!("{truncated}…")
    } else {
        cleaned
    }
}

/// Strict parse: only an exact (case-insensitive, trimmed) `"approve"`
/// counts; everything else — including `"deny"`, which the model is
/// never asked for — escalates to a human.
fn parse_verdict(text: &str) -> AutoApproverVerdict {
    match text.trim().trim_matches(|c: char| c == '"' || c == '.').to_ascii_lowercase().as_str() {
        "approve" => AutoApproverVerdict::Approve,
        _ => AutoApproverVerdict::Escalate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm::{FinishReason, GenerationResponse, LLMError, TokenUsage};
    use async_trait::async_trait;

    struct StubProvider {
        response: Result<String, ()>,
    }

    #[async_trait]
    impl LLMProvider for StubProvider {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse, LLMError> {
            match &self.response {
                Ok(text) => Ok(GenerationResponse {
                    text: text.clone(),
                    usage: TokenUsage::default(),
                    provider: "stub".to_string(),
                    model: "stub".to_string(),
                    finish_reason: FinishReason::Stop,
                }),
                Err(_) => Err(LLMError::Provider("boom".to_string())),
            }
        }

        async fn health_check(&self) -> Result<(), LLMError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_user_message_skips_the_model_and_escalates() {
        let approver = AutoApprover::new(Arc::new(StubProvider {
            response: Ok("approve".to_string()),
        }));
        let verdict = approver.evaluate(None, "read_file", "fs", "outside sandbox", &[]).await;
        assert_eq!(verdict, AutoApproverVerdict::Escalate);
    }

    #[tokio::test]
    async fn exact_approve_response_approves() {
        let approver = AutoApprover::new(Arc::new(StubProvider {
            response: Ok("approve".to_string()),
        }));
        let verdict = approver
            .evaluate(Some("please read my notes"), "read_file", "fs", "outside sandbox", &[])
            .await;
        assert_eq!(verdict, AutoApproverVerdict::Approve);
    }

    #[tokio::test]
    async fn malformed_response_escalates() {
        let approver = AutoApprover::new(Arc::new(StubProvider {
            response: Ok("sure, go ahead!".to_string()),
        }));
        let verdict = approver
            .evaluate(Some("please read my notes"), "read_file", "fs", "outside sandbox", &[])
            .await;
        assert_eq!(verdict, AutoApproverVerdict::Escalate);
    }

    #[tokio::test]
    async fn provider_error_escalates() {
        let approver = AutoApprover::new(Arc::new(StubProvider { response: Err(()) }));
        let verdict = approver
            .evaluate(Some("please read my notes"), "read_file", "fs", "outside sandbox", &[])
            .await;
        assert_eq!(verdict, AutoApproverVerdict::Escalate);
    }

    #[test]
    fn sanitize_identifier_truncates_long_values() {
        let long = "a".repeat(500);
        let sanitized = sanitize_identifier(&long);
        assert!(sanitized.chars().count() <= MAX_IDENTIFIER_LEN + 1);
        assert!(sanitized.ends_with('…'));
    }

    #[test]
    fn sanitize_identifier_strips_control_characters() {
        let sanitized = sanitize_identifier("hello\x07world\n");
        assert_eq!(sanitized, "helloworld");
    }
}
