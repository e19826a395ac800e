//! # Anti-Hallucination Selector
//!
//! Picks the best of several same-role outputs and decides whether a stage
//! should be re-run.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::scoring::ConfidenceScorer;

/// Best candidate: non-empty beats empty, longer beats shorter, first wins ties
pub fn select_best_output(outputs: &[String]) -> String {
    let mut best: Option<&String> = None;
    for output in outputs.iter().filter(|o| !o.trim().is_empty()) {
        match best {
            Some(current) if current.chars().count() >= output.chars().count() => {}
            _ => best = Some(output),
        }
    }
    best.cloned().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAnalysis {
    pub confidence: u8,
    pub best_output: String,
    pub needs_rerun: bool,
}

#[derive(Clone)]
pub struct AntiHallucinationSelector {
    scorer: Arc<dyn ConfidenceScorer>,
}

impl AntiHallucinationSelector {
    pub fn new(scorer: Arc<dyn ConfidenceScorer>) -> Self {
        Self { scorer }
    }

    pub fn analyze_stage_outputs(&self, outputs: &[String], threshold: u8) -> StageAnalysis {
        let non_empty: Vec<String> = outputs
            .iter()
            .filter(|o| !o.trim().is_empty())
            .cloned()
            .collect();
        let confidence = self.scorer.compute_confidence(&non_empty);

        StageAnalysis {
            confidence,
            best_output: select_best_output(outputs),
            needs_rerun: confidence < threshold,
        }
    }

    pub fn should_rerun_validation(&self, analysis: &StageAnalysis, threshold: u8) -> bool {
        analysis.confidence < threshold
    }
}
