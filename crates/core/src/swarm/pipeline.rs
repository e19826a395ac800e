//! # Pipeline Stages
//!
//! Roles, the six swarm stages and the orchestrator's run state machine.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::mode::SwarmMode;

/// Role an agent plays inside a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Researcher,
    Planner,
    Coder,
    Validator,
    Security,
    Synthesizer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Researcher => "researcher",
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Validator => "validator",
            Self::Security => "security",
            Self::Synthesizer => "synthesizer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "researcher" => Some(Self::Researcher),
            "planner" => Some(Self::Planner),
            "coder" => Some(Self::Coder),
            "validator" => Some(Self::Validator),
            "security" => Some(Self::Security),
            "synthesizer" => Some(Self::Synthesizer),
            _ => None,
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Researcher => "Researcher",
            Self::Planner => "Planner",
            Self::Coder => "Coder",
            Self::Validator => "Validator",
            Self::Security => "Security Reviewer",
            Self::Synthesizer => "Synthesizer",
        }
    }

    /// Merge the outputs of one stage into its combined output.
    ///
    /// Researchers are kept side by side as numbered sections, planners and
    /// synthesizers keep only the best candidate, everyone else is joined
    /// with a horizontal rule.
    pub fn join_outputs(&self, outputs: &[String]) -> String {
        let non_empty: Vec<&String> = outputs.iter().filter(|o| !o.trim().is_empty()).collect();

        match self {
            Self::Researcher => non_empty
                .iter()
                .enumerate()
                .map(|(i, o)| format!("## Research {}\n\n{}", i + 1, o.trim()))
                .collect::<Vec<_>>()
                .join("\n\n"),
            Self::Planner | Self::Synthesizer => super::selector::select_best_output(outputs),
            _ => non_empty
                .iter()
                .map(|o| o.trim())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n"),
        }
    }
}

/// One of the six swarm stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Research,
    Plan,
    Code,
    Validate,
    Security,
    Synthesize,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 6] = [
        Stage::Research,
        Stage::Plan,
        Stage::Code,
        Stage::Validate,
        Stage::Security,
        Stage::Synthesize,
    ];

    pub fn role(&self) -> Role {
        match self {
            Self::Research => Role::Researcher,
            Self::Plan => Role::Planner,
            Self::Code => Role::Coder,
            Self::Validate => Role::Validator,
            Self::Security => Role::Security,
            Self::Synthesize => Role::Synthesizer,
        }
    }

    /// 1-based position in the pipeline
    pub fn ordinal(&self) -> usize {
        match self {
            Self::Research => 1,
            Self::Plan => 2,
            Self::Code => 3,
            Self::Validate => 4,
            Self::Security => 5,
            Self::Synthesize => 6,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Research => "RESEARCH",
            Self::Plan => "PLAN",
            Self::Code => "CODE",
            Self::Validate => "VALIDATE",
            Self::Security => "SECURITY",
            Self::Synthesize => "SYNTHESIZE",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Validate => "validate",
            Self::Security => "security",
            Self::Synthesize => "synthesize",
        }
    }

    /// System message announcing the stage, e.g. `Stage 3/6: CODE`
    pub fn banner(&self) -> String {
        format!("Stage {}/{}: {}", self.ordinal(), Stage::ALL.len(), self.label())
    }
}

/// Orchestrator run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "mode")]
pub enum PipelineState {
    Idle,
    ResolvingProviders,
    ModeDispatch,
    Running(SwarmMode),
    GuardrailCheck,
    Completed,
    Failed,
    Cancelled,
    Refused,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Refused
        )
    }

    fn allows(&self, next: PipelineState) -> bool {
        use PipelineState::*;

        if matches!(next, Failed | Cancelled) {
            return !self.is_terminal() && *self != Idle;
        }

        match (*self, next) {
            (Idle, ResolvingProviders) => true,
            (ResolvingProviders, ModeDispatch) => true,
            (ModeDispatch, Running(_)) => true,
            // Chat mode never passes through the guardrail
            (Running(SwarmMode::Chat), Completed) => true,
            (Running(_), GuardrailCheck) => true,
            // The absolute floor refuses before the guardrail runs
            (Running(SwarmMode::Swarm), Refused) => true,
            (GuardrailCheck, Completed | Refused) => true,
            _ => false,
        }
    }
}

/// The run state machine, with a bounded attempt counter for continuous mode
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Current state
    pub state: PipelineState,
    /// Swarm attempts started so far
    pub attempts: u32,
    /// Maximum attempts before surfacing the best fallback
    pub max_attempts: u32,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            attempts: 0,
            max_attempts: 3,
        }
    }
}

impl Pipeline {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.allows(next) {
            anyhow::bail!("Invalid pipeline transition {:?} -> {:?}", self.state, next);
        }
        tracing::trace!(from = ?self.state, to = ?next, "Pipeline transition");
        self.state = next;
        Ok(())
    }

    /// Start another swarm attempt. Returns false once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }
}
