//! # Confidence Scoring
//!
//! Maps a set of outputs to a 0..=100 confidence and pulls citation-like
//! sources out of text.
//!
//! [`AgreementScorer`] is the default heuristic. Its score never decreases
//! when outputs are added or lengthened:
//!
//! | component  | points | grows with                                   |
//! |------------|--------|----------------------------------------------|
//! | base       | 30     | at least one non-empty output                |
//! | volume     | 0..=20 | number of outputs (4 per extra, max 5)       |
//! | length     | 0..=30 | longest output, saturating at 1500 chars     |
//! | structure  | 0..=15 | fences, headings, lists, citations           |
//! | agreement  | 0..=20 | best pairwise token overlap                  |

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub trait ConfidenceScorer: Send + Sync {
    /// Confidence for a set of outputs; empty outputs are ignored
    fn compute_confidence(&self, outputs: &[String]) -> u8;

    /// URLs, `path:line` references and `[n]` citations, first-seen order
    fn extract_sources(&self, text: &str) -> Vec<String>;
}

const LENGTH_SATURATION: f64 = 1500.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct AgreementScorer;

impl AgreementScorer {
    pub fn new() -> Self {
        Self
    }
}

impl ConfidenceScorer for AgreementScorer {
    fn compute_confidence(&self, outputs: &[String]) -> u8 {
        let outputs: Vec<&str> = outputs
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .collect();

        if outputs.is_empty() {
            return 0;
        }

        let base = 30.0;
        let volume = ((outputs.len() - 1).min(5) * 4) as f64;

        let longest = outputs
            .iter()
            .map(|o| o.chars().count())
            .max()
            .unwrap_or(0) as f64;
        let length = 30.0 * (longest / LENGTH_SATURATION).min(1.0);

        let structure = outputs
            .iter()
            .map(|o| structure_points(o))
            .fold(0.0, f64::max);

        let agreement = 20.0 * best_pairwise_overlap(&outputs);

        let total = base + volume + length + structure + agreement;
        total.round().clamp(0.0, 100.0) as u8
    }

    fn extract_sources(&self, text: &str) -> Vec<String> {
        let Some(patterns) = source_patterns() else {
            return Vec::new();
        };

        let mut found: Vec<(usize, String)> = Vec::new();
        for pattern in patterns {
            for m in pattern.find_iter(text) {
                let source = m
                    .as_str()
                    .trim_end_matches(|c: char| matches!(c, '.' | ',' | ')' | ';' | ':'));
                found.push((m.start(), source.to_string()));
            }
        }
        found.sort_by_key(|(start, _)| *start);

        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter(|(_, s)| !s.is_empty() && seen.insert(s.clone()))
            .map(|(_, s)| s)
            .collect()
    }
}

fn source_patterns() -> Option<&'static [Regex]> {
    static PATTERNS: OnceLock<Option<Vec<Regex>>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            [
                r#"https?://[^\s<>"'`\]]+"#,
                r"\b[\w./-]+\.[A-Za-z0-9]{1,8}:\d+\b",
                r"\[\d{1,3}\]",
            ]
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .ok()
        })
        .as_deref()
}

/// Up to 15 points for visible structure in one output
fn structure_points(output: &str) -> f64 {
    let mut points = 0.0;
    if output.contains("```") {
        points += 5.0;
    }
    if output.lines().any(|l| l.trim_start().starts_with('#')) {
        points += 4.0;
    }
    if output.lines().any(|l| {
        let l = l.trim_start();
        l.starts_with("- ") || l.starts_with("* ") || l.split_once(". ").is_some_and(|(n, _)| n.parse::<u32>().is_ok())
    }) {
        points += 3.0;
    }
    if output.contains("http://") || output.contains("https://") {
        points += 3.0;
    }
    points
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Highest Jaccard similarity over all output pairs, 0.0 for a single output
fn best_pairwise_overlap(outputs: &[&str]) -> f64 {
    let sets: Vec<HashSet<String>> = outputs.iter().map(|o| tokens(o)).collect();
    let mut best: f64 = 0.0;
    for i in 0..sets.len() {
        for j in (i + 1)..sets.len() {
            let union = sets[i].union(&sets[j]).count();
            if union == 0 {
                continue;
            }
            let shared = sets[i].intersection(&sets[j]).count();
            best = best.max(shared as f64 / union as f64);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_empty_outputs_score_zero() {
        let scorer = AgreementScorer::new();
        assert_eq!(scorer.compute_confidence(&[]), 0);
        assert_eq!(scorer.compute_confidence(&s(&["", "   "])), 0);
    }

    #[test]
    fn test_single_short_output() {
        let score = AgreementScorer::new().compute_confidence(&s(&["ok"]));
        assert_eq!(score, 30);
    }

    #[test]
    fn test_monotone_in_count_and_length() {
        let scorer = AgreementScorer::new();
        let one = scorer.compute_confidence(&s(&["some answer"]));
        let two = scorer.compute_confidence(&s(&["some answer", "other words"]));
        assert!(two >= one);

        let long = "word ".repeat(400);
        let longer = scorer.compute_confidence(&s(&["some answer", long.as_str()]));
        assert!(longer >= two);
    }

    #[test]
    fn test_capped_at_100() {
        let body = format!(
            "# Plan\n\n- step\n\n```rust\nfn main() {{}}\n```\nhttps://docs.rs {}",
            "detail ".repeat(400)
        );
        let outputs = vec![body.clone(); 8];
        assert_eq!(AgreementScorer::new().compute_confidence(&outputs), 100);
    }

    #[test]
    fn test_extract_sources() {
        let text = "See https://docs.rs/tokio. Also src/main.rs:42 and [1], \
                    again https://docs.rs/tokio and [1].";
        let sources = AgreementScorer::new().extract_sources(text);
        assert_eq!(sources, vec!["https://docs.rs/tokio", "src/main.rs:42", "[1]"]);
    }

    #[test]
    fn test_no_sources() {
        assert!(AgreementScorer::new()
            .extract_sources("just words here")
            .is_empty());
    }
}
