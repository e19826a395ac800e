//! # Agent Instances
//!
//! One spawned worker for one role in one stage, and the aggregate result
//! of a stage.
//!
//! Status only moves forward: `spawning → running → completed | failed`, or
//! straight to `cancelled` from either non-terminal state. Every mutator
//! returns `false` and leaves the instance untouched once it is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::pipeline::{Role, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    /// `{stage}-{role}-{index}` plus an optional suffix
    pub id: String,
    pub stage: Stage,
    pub role: Role,
    pub label: String,
    pub provider: String,
    pub status: AgentStatus,
    pub output: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub worktree: Option<PathBuf>,
    /// Served from the output cache without spawning
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentInstance {
    pub fn new(stage: Stage, index: usize, provider: &str, suffix: Option<&str>) -> Self {
        let role = stage.role();
        let mut id = format!("{}-{}-{}", stage.as_str(), role.as_str(), index);
        if let Some(suffix) = suffix {
            id.push('-');
            id.push_str(suffix);
        }

        Self {
            id,
            stage,
            role,
            label: format!("{} #{}", role.label(), index + 1),
            provider: provider.to_string(),
            status: AgentStatus::Spawning,
            output: String::new(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            worktree: None,
            from_cache: false,
            error: None,
        }
    }

    pub fn mark_running(&mut self) -> bool {
        if self.status != AgentStatus::Spawning {
            return false;
        }
        self.status = AgentStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn append_output(&mut self, chunk: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.output.push_str(chunk);
        true
    }

    /// Finish with the worker's exit code; zero completes, anything else fails
    pub fn complete(&mut self, exit_code: i32) -> bool {
        if self.status != AgentStatus::Running {
            return false;
        }
        self.exit_code = Some(exit_code);
        self.finished_at = Some(Utc::now());
        if exit_code == 0 {
            self.status = AgentStatus::Completed;
        } else {
            self.status = AgentStatus::Failed;
            self.error = Some(format!("worker exited with code {}", exit_code));
        }
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = AgentStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(reason.into());
        true
    }

    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = AgentStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Completed straight from a cache entry
    pub fn complete_from_cache(&mut self, output: String) -> bool {
        if self.status != AgentStatus::Spawning {
            return false;
        }
        let now = Utc::now();
        self.output = output;
        self.status = AgentStatus::Completed;
        self.started_at = Some(now);
        self.finished_at = Some(now);
        self.exit_code = Some(0);
        self.from_cache = true;
        true
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Completed
    }
}

/// Aggregate of one stage's run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    /// One instance per requested agent, in index order
    pub agents: Vec<AgentInstance>,
    /// Output merged with the role's join policy
    pub combined_output: String,
    /// Raw per-agent outputs, in index order
    pub outputs: Vec<String>,
}

impl StageResult {
    pub fn empty(stage: Stage) -> Self {
        Self {
            stage,
            agents: Vec::new(),
            combined_output: String::new(),
            outputs: Vec::new(),
        }
    }

    pub fn from_agents(stage: Stage, agents: Vec<AgentInstance>) -> Self {
        let outputs: Vec<String> = agents.iter().map(|a| a.output.clone()).collect();
        let successful: Vec<String> = agents
            .iter()
            .map(|a| if a.is_success() { a.output.clone() } else { String::new() })
            .collect();
        let combined_output = stage.role().join_outputs(&successful);

        Self {
            stage,
            agents,
            combined_output,
            outputs,
        }
    }

    /// Output per agent, empty for agents that did not succeed
    pub fn successful_outputs(&self) -> Vec<String> {
        self.agents
            .iter()
            .map(|a| if a.is_success() { a.output.clone() } else { String::new() })
            .collect()
    }

    /// Non-empty successful outputs only
    pub fn non_empty_outputs(&self) -> Vec<String> {
        self.successful_outputs()
            .into_iter()
            .filter(|o| !o.trim().is_empty())
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Failed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_format() {
        let agent = AgentInstance::new(Stage::Code, 2, "claude", None);
        assert_eq!(agent.id, "code-coder-2");
        assert_eq!(agent.label, "Coder #3");

        let rerun = AgentInstance::new(Stage::Validate, 0, "codex", Some("rerun"));
        assert_eq!(rerun.id, "validate-validator-0-rerun");
    }

    #[test]
    fn test_monotone_transitions() {
        let mut agent = AgentInstance::new(Stage::Research, 0, "claude", None);
        assert!(!agent.complete(0), "cannot complete before running");
        assert!(agent.mark_running());
        assert!(!agent.mark_running());
        assert!(agent.append_output("hello"));
        assert!(agent.complete(0));
        assert_eq!(agent.status, AgentStatus::Completed);

        // Terminal: output and exit code are frozen
        assert!(!agent.append_output(" world"));
        assert!(!agent.fail("late"));
        assert!(!agent.cancel());
        assert_eq!(agent.output, "hello");
        assert_eq!(agent.exit_code, Some(0));
    }

    #[test]
    fn test_nonzero_exit_fails() {
        let mut agent = AgentInstance::new(Stage::Code, 0, "claude", None);
        agent.mark_running();
        agent.complete(2);
        assert_eq!(agent.status, AgentStatus::Failed);
        assert!(agent.error.unwrap().contains("code 2"));
    }

    #[test]
    fn test_cancel_from_spawning() {
        let mut agent = AgentInstance::new(Stage::Code, 0, "claude", None);
        assert!(agent.cancel());
        assert_eq!(agent.status, AgentStatus::Cancelled);
        assert!(agent.started_at.is_none());
    }

    #[test]
    fn test_stage_result_views() {
        let mut ok = AgentInstance::new(Stage::Code, 0, "a", None);
        ok.mark_running();
        ok.append_output("fn main() {}");
        ok.complete(0);

        let mut bad = AgentInstance::new(Stage::Code, 1, "b", None);
        bad.mark_running();
        bad.append_output("partial");
        bad.complete(1);

        let result = StageResult::from_agents(Stage::Code, vec![ok, bad]);
        assert_eq!(result.agents.len(), 2);
        assert_eq!(result.successful_outputs(), vec!["fn main() {}".to_string(), String::new()]);
        assert_eq!(result.non_empty_outputs().len(), 1);
        assert_eq!(result.combined_output, "fn main() {}");
        assert_eq!(result.outputs[1], "partial");
        assert_eq!(result.failed_count(), 1);
    }
}
