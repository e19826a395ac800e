//! # Mode Detection
//!
//! Picks chat, swarm or project mode from the prompt when the caller does
//! not force one.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// How the orchestrator runs a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwarmMode {
    /// One CODE worker, no guardrail
    #[default]
    Chat,
    /// The six-stage pipeline
    Swarm,
    /// Plan, tickets, sequential execution
    Project,
}

impl SwarmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Swarm => "swarm",
            Self::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(Self::Chat),
            "swarm" => Some(Self::Swarm),
            "project" => Some(Self::Project),
            _ => None,
        }
    }
}

/// Prompts must be longer than this to be treated as projects
pub const PROJECT_MIN_PROMPT_CHARS: usize = 200;

const PROJECT_KEYWORDS: &[&str] = &[
    "build a",
    "create a",
    "implement",
    "application",
    "project",
    "full-stack",
    "from scratch",
    "website",
    "service",
    "platform",
    "end-to-end",
];

fn swarm_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)\b(refactor|review|fix|optimi[sz]e|test|security audit|code)").ok()
        })
        .as_ref()
}

/// Infer the mode for a prompt
pub fn detect_mode(prompt: &str) -> SwarmMode {
    let lower = prompt.to_lowercase();

    let is_project = prompt.chars().count() > PROJECT_MIN_PROMPT_CHARS
        && PROJECT_KEYWORDS.iter().any(|k| lower.contains(k));
    if is_project {
        return SwarmMode::Project;
    }

    if swarm_pattern().is_some_and(|re| re.is_match(prompt)) {
        return SwarmMode::Swarm;
    }

    SwarmMode::Chat
}

/// Explicit override wins over detection
pub fn resolve_mode(prompt: &str, requested: Option<SwarmMode>) -> SwarmMode {
    requested.unwrap_or_else(|| detect_mode(prompt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_table() {
        let long_project = format!(
            "Build a full-stack application for tracking inventory. {}",
            "It needs users, roles, audit logs and reporting. ".repeat(5)
        );
        assert!(long_project.len() > PROJECT_MIN_PROMPT_CHARS);

        let cases = [
            ("What is TypeScript?", SwarmMode::Chat),
            ("Refactor the authentication module", SwarmMode::Swarm),
            ("Please review my pull request", SwarmMode::Swarm),
            ("Optimise the hot loop", SwarmMode::Swarm),
            ("Run a security audit on the API", SwarmMode::Swarm),
            ("Build a website", SwarmMode::Chat),
            ("Tell me about prefix trees", SwarmMode::Chat),
            (long_project.as_str(), SwarmMode::Project),
        ];

        for (prompt, expected) in cases {
            assert_eq!(detect_mode(prompt), expected, "prompt: {prompt}");
        }
    }

    #[test]
    fn test_word_start_matching() {
        // "prefix" contains "fix" but not at a word start
        assert_eq!(detect_mode("explain prefix sums"), SwarmMode::Chat);
        assert_eq!(detect_mode("add tests for the parser"), SwarmMode::Swarm);
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(
            resolve_mode("What is TypeScript?", Some(SwarmMode::Swarm)),
            SwarmMode::Swarm
        );
        assert_eq!(resolve_mode("What is TypeScript?", None), SwarmMode::Chat);
        assert_eq!(SwarmMode::parse("Project"), Some(SwarmMode::Project));
        assert_eq!(SwarmMode::parse("bogus"), None);
    }
}
