//! # Guardrail Policy
//!
//! Final gate on a candidate output. A run passes when confidence and
//! evidence meet their minimums and upstream validation passed; otherwise the
//! decision carries a refusal payload for formatting and escalation.
//!
//! The absolute floor is a separate, stricter check applied to swarm runs
//! before the guardrail: below [`ABSOLUTE_CONFIDENCE_FLOOR`] with no sources
//! at all, the output is replaced by [`REFUSED_OUTPUT`].

use serde::{Deserialize, Serialize};

use super::mode::SwarmMode;
use crate::state::evidence::truncate_chars;

/// Confidence under this with zero sources short-circuits to a refusal
pub const ABSOLUTE_CONFIDENCE_FLOOR: u8 = 30;

/// Output returned when the absolute floor trips
pub const REFUSED_OUTPUT: &str = "refused";

/// Prompt length kept in refusal payloads
pub const REFUSAL_PROMPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardrailConfig {
    pub min_confidence: u8,
    pub min_evidence_count: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            min_confidence: 40,
            min_evidence_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailContext {
    pub pipeline: String,
    pub mode: SwarmMode,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct GuardrailInput<'a> {
    pub min_confidence: u8,
    pub min_evidence_count: usize,
    pub confidence: u8,
    pub evidence: &'a [String],
    pub candidate_output: &'a str,
    pub upstream_validation_passed: bool,
    pub context: GuardrailContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RefusalReason {
    LowConfidence { confidence: u8, required: u8 },
    InsufficientEvidence { found: usize, required: usize },
    ValidationFailed,
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowConfidence {
                confidence,
                required,
            } => write!(f, "confidence {}% is below the required {}%", confidence, required),
            Self::InsufficientEvidence { found, required } => write!(
                f,
                "found {} evidence source(s), {} required",
                found, required
            ),
            Self::ValidationFailed => write!(f, "upstream validation did not pass"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefusalPayload {
    pub reasons: Vec<RefusalReason>,
    pub pipeline: String,
    pub mode: SwarmMode,
    /// Prompt truncated to [`REFUSAL_PROMPT_CHARS`]
    pub prompt: String,
    pub confidence: u8,
    pub evidence_count: usize,
    pub candidate_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailDecision {
    pub passed: bool,
    pub refusal: Option<RefusalPayload>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GuardrailPolicy;

impl GuardrailPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, input: &GuardrailInput<'_>) -> GuardrailDecision {
        let mut reasons = Vec::new();

        if input.confidence < input.min_confidence {
            reasons.push(RefusalReason::LowConfidence {
                confidence: input.confidence,
                required: input.min_confidence,
            });
        }
        if input.evidence.len() < input.min_evidence_count {
            reasons.push(RefusalReason::InsufficientEvidence {
                found: input.evidence.len(),
                required: input.min_evidence_count,
            });
        }
        if !input.upstream_validation_passed {
            reasons.push(RefusalReason::ValidationFailed);
        }

        if reasons.is_empty() {
            return GuardrailDecision {
                passed: true,
                refusal: None,
            };
        }

        GuardrailDecision {
            passed: false,
            refusal: Some(RefusalPayload {
                reasons,
                pipeline: input.context.pipeline.clone(),
                mode: input.context.mode,
                prompt: truncate_chars(&input.context.prompt, REFUSAL_PROMPT_CHARS),
                confidence: input.confidence,
                evidence_count: input.evidence.len(),
                candidate_chars: input.candidate_output.chars().count(),
            }),
        }
    }
}

/// Human-readable refusal message
pub fn format_refusal(payload: &RefusalPayload) -> String {
    let mut message = format!(
        "Guardrail refused the {} result ({} mode).\n\nReasons:\n",
        payload.pipeline,
        payload.mode.as_str()
    );
    for reason in &payload.reasons {
        message.push_str(&format!("- {}\n", reason));
    }
    message.push_str(&format!(
        "\nConfidence: {}%\nEvidence sources: {}\nPrompt: {}\n\nAn escalation ticket was opened for human review.",
        payload.confidence, payload.evidence_count, payload.prompt
    ));
    message
}

/// Stricter safety net in front of the guardrail
pub fn below_absolute_floor(confidence: u8, sources: &[String]) -> bool {
    confidence < ABSOLUTE_CONFIDENCE_FLOOR && sources.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(confidence: u8, evidence: &'a [String], validated: bool) -> GuardrailInput<'a> {
        let config = GuardrailConfig::default();
        GuardrailInput {
            min_confidence: config.min_confidence,
            min_evidence_count: 1,
            confidence,
            evidence,
            candidate_output: "candidate",
            upstream_validation_passed: validated,
            context: GuardrailContext {
                pipeline: "swarm".into(),
                mode: SwarmMode::Swarm,
                prompt: "x".repeat(500),
            },
        }
    }

    #[test]
    fn test_passes_when_all_conditions_hold() {
        let evidence = vec!["https://docs.rs".to_string()];
        let decision = GuardrailPolicy::new().evaluate(&input(40, &evidence, true));
        assert!(decision.passed);
        assert!(decision.refusal.is_none());
    }

    #[test]
    fn test_refusal_lists_every_reason() {
        let decision = GuardrailPolicy::new().evaluate(&input(10, &[], false));
        assert!(!decision.passed);

        let refusal = decision.refusal.unwrap();
        assert_eq!(refusal.reasons.len(), 3);
        assert!(refusal.prompt.chars().count() <= REFUSAL_PROMPT_CHARS + 1);

        let message = format_refusal(&refusal);
        assert!(message.contains("confidence 10% is below the required 40%"));
        assert!(message.contains("upstream validation did not pass"));
    }

    #[test]
    fn test_validation_alone_blocks() {
        let evidence = vec!["a".to_string()];
        let decision = GuardrailPolicy::new().evaluate(&input(99, &evidence, false));
        assert!(!decision.passed);
        assert_eq!(
            decision.refusal.unwrap().reasons,
            vec![RefusalReason::ValidationFailed]
        );
    }

    #[test]
    fn test_absolute_floor() {
        assert!(below_absolute_floor(25, &[]));
        assert!(!below_absolute_floor(30, &[]));
        assert!(!below_absolute_floor(25, &["[1]".to_string()]));
    }
}
