//! # Stage Runner
//!
//! Spawns the agents of one stage, staggers their starts, streams their
//! output and collects one [`AgentInstance`] per requested agent.
//!
//! Agents settle independently: a spawn error or a panicking task becomes a
//! failed instance at its index and never aborts its siblings. Worktrees
//! created for the stage are removed once every agent has settled.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::agent::{AgentInstance, StageResult};
use super::cache::OutputCache;
use super::context::RunContext;
use super::events::{EventSink, SwarmEvent, SwarmEventKind};
use super::pipeline::Stage;
use super::scoring::ConfidenceScorer;
use super::worker::{WorkerEvent, WorkerHandle, WorkerRequest, WorkerSpawner, KILLED_EXIT_CODE};
use crate::models::ResolvedProviders;
use crate::state::settings::SwarmSettings;
use crate::tools::git::WorktreeManager;

/// Provider name recorded when nothing resolved
const NO_PROVIDER: &str = "none";

/// Prompt(s) for a stage
#[derive(Debug, Clone)]
pub enum StagePrompts {
    /// Same prompt for every agent
    Broadcast(String),
    /// Prompt per agent index; short lists repeat their last entry
    PerAgent(Vec<String>),
}

impl StagePrompts {
    pub fn prompt_for(&self, index: usize) -> &str {
        match self {
            Self::Broadcast(prompt) => prompt,
            Self::PerAgent(prompts) => prompts
                .get(index)
                .or_else(|| prompts.last())
                .map(String::as_str)
                .unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOptions {
    pub project_path: PathBuf,
    pub use_worktrees: bool,
    pub chats_per_agent: u32,
    pub stagger: Duration,
    pub max_runtime: Duration,
    /// Appended to agent ids, e.g. `rerun` or `attempt2`
    pub id_suffix: Option<String>,
}

impl StageOptions {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            use_worktrees: false,
            chats_per_agent: 1,
            stagger: Duration::from_millis(200),
            max_runtime: Duration::from_secs(600),
            id_suffix: None,
        }
    }

    pub fn from_settings(settings: &SwarmSettings, project_path: &Path) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
            use_worktrees: settings.use_worktrees,
            chats_per_agent: settings.chats_per_agent.max(1),
            stagger: Duration::from_millis(settings.stagger_ms),
            max_runtime: Duration::from_secs(settings.max_runtime_secs),
            id_suffix: None,
        }
    }

    pub fn with_suffix(mut self, suffix: Option<String>) -> Self {
        self.id_suffix = suffix;
        self
    }
}

#[derive(Clone)]
pub struct StageRunner {
    spawner: Arc<dyn WorkerSpawner>,
    cache: Arc<OutputCache>,
    scorer: Arc<dyn ConfidenceScorer>,
    worktrees: Arc<WorktreeManager>,
    providers: Arc<ResolvedProviders>,
    context: Arc<RunContext>,
    events: EventSink,
}

impl StageRunner {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        cache: Arc<OutputCache>,
        scorer: Arc<dyn ConfidenceScorer>,
        worktrees: Arc<WorktreeManager>,
        providers: Arc<ResolvedProviders>,
        context: Arc<RunContext>,
        events: EventSink,
    ) -> Self {
        Self {
            spawner,
            cache,
            scorer,
            worktrees,
            providers,
            context,
            events,
        }
    }

    /// Run `count` agents for `stage`. Always returns exactly `count` agents.
    pub async fn run_stage(
        &self,
        stage: Stage,
        count: usize,
        prompts: &StagePrompts,
        options: &StageOptions,
    ) -> StageResult {
        if count == 0 {
            return StageResult::empty(stage);
        }

        let isolate = options.use_worktrees && WorktreeManager::is_git_repo(&options.project_path);
        let created: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        tracing::info!(stage = stage.label(), count, isolate, "Running stage");
        self.events.emit(
            SwarmEvent::new(SwarmEventKind::StageStarted, stage.as_str())
                .with_data(json!({ "count": count })),
        );

        let mut tasks = Vec::with_capacity(count);
        for index in 0..count {
            let provider = self
                .providers
                .pick(index)
                .map(|p| p.id.clone())
                .unwrap_or_else(|| NO_PROVIDER.to_string());
            let agent = AgentInstance::new(stage, index, &provider, options.id_suffix.as_deref());
            let prompt = prompts.prompt_for(index).to_string();
            let delay = options.stagger.saturating_mul(index as u32);

            let runner = self.clone();
            let options = options.clone();
            let created = Arc::clone(&created);
            let pending = agent.clone();

            let handle = tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                runner
                    .run_agent(agent, prompt, &options, isolate, &created)
                    .await
            });
            tasks.push((pending, handle));
        }

        // Awaited in index order so results never depend on completion order
        let mut agents = Vec::with_capacity(count);
        for (mut pending, handle) in tasks {
            match handle.await {
                Ok(agent) => agents.push(agent),
                Err(e) => {
                    tracing::error!(agent_id = %pending.id, "Agent task failed: {}", e);
                    pending.fail(format!("agent task failed: {}", e));
                    self.emit_agent(&pending, SwarmEventKind::AgentFailed);
                    agents.push(pending);
                }
            }
        }

        let worktree_ids: Vec<String> = created
            .lock()
            .map(|mut ids| std::mem::take(&mut *ids))
            .unwrap_or_default();
        for id in worktree_ids {
            if let Err(e) = self
                .worktrees
                .cleanup_worktree(&options.project_path, &id)
                .await
            {
                tracing::warn!(agent_id = %id, "Failed to clean up worktree: {}", e);
            }
        }

        let result = StageResult::from_agents(stage, agents);
        self.events.emit(
            SwarmEvent::new(SwarmEventKind::StageCompleted, stage.as_str()).with_data(json!({
                "count": count,
                "failed": result.failed_count(),
            })),
        );
        result
    }

    async fn run_agent(
        &self,
        mut agent: AgentInstance,
        prompt: String,
        options: &StageOptions,
        isolate: bool,
        created: &Mutex<Vec<String>>,
    ) -> AgentInstance {
        if self.context.is_cancelled() {
            agent.cancel();
            self.emit_agent(&agent, SwarmEventKind::AgentCancelled);
            return agent;
        }

        if let Some(hit) = self.cache.get(&prompt, &agent.provider) {
            agent.complete_from_cache(hit.output);
            self.events.emit(
                SwarmEvent::new(SwarmEventKind::CacheHit, &agent.id)
                    .with_data(json!({ "provider": agent.provider, "confidence": hit.confidence })),
            );
            return agent;
        }

        let workdir = if isolate {
            match self
                .worktrees
                .create_worktree(&options.project_path, &agent.id)
                .await
            {
                Ok(path) => {
                    if let Ok(mut ids) = created.lock() {
                        ids.push(agent.id.clone());
                    }
                    agent.worktree = Some(path.clone());
                    path
                }
                Err(e) => {
                    tracing::warn!(
                        agent_id = %agent.id,
                        "Worktree creation failed, sharing project directory: {:#}", e
                    );
                    options.project_path.clone()
                }
            }
        } else {
            options.project_path.clone()
        };

        agent.mark_running();
        self.events.emit(
            SwarmEvent::new(SwarmEventKind::AgentStarted, &agent.id).with_data(json!({
                "provider": agent.provider,
                "workdir": workdir.display().to_string(),
            })),
        );

        let chats = options.chats_per_agent.max(1);
        for chat in 1..=chats {
            if self.context.is_cancelled() {
                agent.cancel();
                self.emit_agent(&agent, SwarmEventKind::AgentCancelled);
                return agent;
            }

            if chats > 1 {
                let separator = if chat > 1 { "\n" } else { "" };
                agent.append_output(&format!("{}--- chat {}/{} ---\n", separator, chat, chats));
            }

            let request = WorkerRequest {
                agent_id: agent.id.clone(),
                provider: agent.provider.clone(),
                prompt: prompt.clone(),
                workdir: workdir.clone(),
                max_runtime: options.max_runtime,
            };

            let handle = match self.spawner.spawn(request).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, "Worker spawn failed: {}", e);
                    agent.fail(e.to_string());
                    self.emit_agent(&agent, SwarmEventKind::AgentFailed);
                    return agent;
                }
            };

            let code = self.drive(&mut agent, handle).await;
            if code != 0 {
                if self.context.is_cancelled() {
                    agent.cancel();
                    self.emit_agent(&agent, SwarmEventKind::AgentCancelled);
                } else {
                    agent.complete(code);
                    tracing::warn!(agent_id = %agent.id, exit_code = code, "Worker failed");
                    self.emit_agent(&agent, SwarmEventKind::AgentFailed);
                }
                return agent;
            }
        }

        agent.complete(0);
        if !agent.output.trim().is_empty() {
            let confidence = self
                .scorer
                .compute_confidence(std::slice::from_ref(&agent.output));
            self.cache
                .set(&prompt, &agent.provider, &agent.output, confidence);
        }
        self.emit_agent(&agent, SwarmEventKind::AgentCompleted);
        agent
    }

    /// Pump one worker's events into the agent; returns its exit code
    async fn drive(&self, agent: &mut AgentInstance, mut handle: WorkerHandle) -> i32 {
        self.context.track(&agent.id, handle.kill.clone());
        // A cancel that raced the registration above would have missed us
        if self.context.is_cancelled() {
            handle.kill.kill();
        }

        let mut code = KILLED_EXIT_CODE;
        while let Some(event) = handle.events.recv().await {
            match event {
                WorkerEvent::Output(chunk) => {
                    agent.append_output(&chunk);
                    self.events.emit(
                        SwarmEvent::new(SwarmEventKind::AgentOutput, &agent.id)
                            .with_data(json!({ "chunk": chunk })),
                    );
                }
                WorkerEvent::Exit(exit_code) => {
                    code = exit_code;
                    break;
                }
            }
        }

        self.context.untrack(&agent.id);
        code
    }

    fn emit_agent(&self, agent: &AgentInstance, kind: SwarmEventKind) {
        self.events.emit(SwarmEvent::new(kind, &agent.id).with_data(json!({
            "provider": agent.provider,
            "status": agent.status,
            "exit_code": agent.exit_code,
            "error": agent.error,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::agent::AgentStatus;
    use crate::swarm::cache::CACHE_REUSE_THRESHOLD;
    use crate::swarm::scoring::AgreementScorer;
    use crate::swarm::worker::mock::{MockReply, MockSpawner};

    struct Harness {
        runner: StageRunner,
        spawner: Arc<MockSpawner>,
        cache: Arc<OutputCache>,
        context: Arc<RunContext>,
    }

    fn harness(spawner: MockSpawner) -> Harness {
        let spawner = Arc::new(spawner);
        let cache = Arc::new(OutputCache::new());
        let context = Arc::new(RunContext::new());
        let worktree_root = std::env::temp_dir().join("hivemind-runner-tests");
        let runner = StageRunner::new(
            spawner.clone(),
            cache.clone(),
            Arc::new(AgreementScorer::new()),
            Arc::new(WorktreeManager::new(worktree_root)),
            Arc::new(ResolvedProviders::from_ids(["alpha", "beta"])),
            context.clone(),
            EventSink::disabled(),
        );
        Harness {
            runner,
            spawner,
            cache,
            context,
        }
    }

    fn options() -> StageOptions {
        let mut options = StageOptions::new(std::env::temp_dir());
        options.stagger = Duration::from_millis(5);
        options
    }

    fn broadcast(prompt: &str) -> StagePrompts {
        StagePrompts::Broadcast(prompt.to_string())
    }

    #[tokio::test]
    async fn test_zero_count_is_empty() {
        let h = harness(MockSpawner::echo());
        let result = h
            .runner
            .run_stage(Stage::Research, 0, &broadcast("p"), &options())
            .await;
        assert!(result.agents.is_empty());
        assert!(h.spawner.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_count_preserved_on_failures() {
        let h = harness(MockSpawner::new(|req| match req.agent_id.as_str() {
            "code-coder-1" => MockReply::exit("broken", 2),
            "code-coder-2" => MockReply::SpawnError,
            _ => MockReply::ok("fine"),
        }));

        let result = h
            .runner
            .run_stage(Stage::Code, 4, &broadcast("p"), &options())
            .await;

        assert_eq!(result.agents.len(), 4);
        let statuses: Vec<AgentStatus> = result.agents.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![
                AgentStatus::Completed,
                AgentStatus::Failed,
                AgentStatus::Failed,
                AgentStatus::Completed
            ]
        );
        assert_eq!(result.successful_outputs()[1], "");
        assert_eq!(result.agents[1].exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_round_robin_and_stagger_order() {
        let h = harness(MockSpawner::echo());
        let mut opts = options();
        opts.stagger = Duration::from_millis(30);

        let result = h
            .runner
            .run_stage(Stage::Research, 3, &broadcast("p"), &opts)
            .await;

        let providers: Vec<&str> = result.agents.iter().map(|a| a.provider.as_str()).collect();
        assert_eq!(providers, vec!["alpha", "beta", "alpha"]);

        let spawned: Vec<String> = h.spawner.spawned().into_iter().map(|r| r.agent_id).collect();
        assert_eq!(
            spawned,
            vec!["research-researcher-0", "research-researcher-1", "research-researcher-2"]
        );
    }

    #[tokio::test]
    async fn test_per_agent_prompts() {
        let h = harness(MockSpawner::new(|req| MockReply::ok(&req.prompt)));
        let prompts = StagePrompts::PerAgent(vec!["first".into(), "second".into()]);

        let result = h.runner.run_stage(Stage::Code, 3, &prompts, &options()).await;
        let outputs: Vec<&str> = result.agents.iter().map(|a| a.output.as_str()).collect();
        assert_eq!(outputs, vec!["first", "second", "second"]);
    }

    #[tokio::test]
    async fn test_cache_write_then_hit_skips_spawn() {
        let h = harness(MockSpawner::echo());

        h.runner
            .run_stage(Stage::Plan, 1, &broadcast("plan it"), &options())
            .await;
        assert_eq!(h.cache.len(), 1, "successful output is written through");
        assert_eq!(h.spawner.spawned().len(), 1);

        // Low-confidence entry is not reused, so seed a confident one
        h.cache
            .set("plan it", "alpha", "cached plan", CACHE_REUSE_THRESHOLD + 10);
        let result = h
            .runner
            .run_stage(Stage::Plan, 1, &broadcast("plan it"), &options())
            .await;

        assert_eq!(h.spawner.spawned().len(), 1, "no new spawn on cache hit");
        assert!(result.agents[0].from_cache);
        assert_eq!(result.agents[0].output, "cached plan");
        assert_eq!(result.agents[0].status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_output_not_cached() {
        let h = harness(MockSpawner::new(|_| MockReply::exit("half done", 1)));
        h.runner
            .run_stage(Stage::Code, 1, &broadcast("p"), &options())
            .await;
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(MockSpawner::echo());
        h.context.cancel();

        let result = h
            .runner
            .run_stage(Stage::Code, 2, &broadcast("p"), &options())
            .await;
        assert!(result
            .agents
            .iter()
            .all(|a| a.status == AgentStatus::Cancelled));
        assert!(h.spawner.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_kills_running_workers() {
        let h = harness(MockSpawner::new(|_| {
            MockReply::slow("never", Duration::from_secs(30))
        }));

        let context = h.context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            context.cancel();
        });

        let mut opts = options();
        opts.stagger = Duration::ZERO;
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            h.runner.run_stage(Stage::Code, 2, &broadcast("p"), &opts),
        )
        .await
        .expect("cancel should stop the stage");

        assert!(result
            .agents
            .iter()
            .all(|a| a.status == AgentStatus::Cancelled));
        assert_eq!(h.context.live_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_chats_are_sequential_and_delimited() {
        let h = harness(MockSpawner::new(|_| MockReply::ok("reply")));
        let mut opts = options();
        opts.chats_per_agent = 2;

        let result = h
            .runner
            .run_stage(Stage::Research, 1, &broadcast("p"), &opts)
            .await;
        let output = &result.agents[0].output;
        assert!(output.starts_with("--- chat 1/2 ---\nreply"));
        assert!(output.contains("\n--- chat 2/2 ---\nreply"));
        assert_eq!(h.spawner.spawned().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_chat_stops_agent() {
        let h = harness(MockSpawner::new(|_| MockReply::exit("bad", 1)));
        let mut opts = options();
        opts.chats_per_agent = 3;

        let result = h
            .runner
            .run_stage(Stage::Research, 1, &broadcast("p"), &opts)
            .await;
        assert_eq!(result.agents[0].status, AgentStatus::Failed);
        assert_eq!(h.spawner.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_suffix() {
        let h = harness(MockSpawner::echo());
        let opts = options().with_suffix(Some("rerun".into()));
        let result = h
            .runner
            .run_stage(Stage::Validate, 1, &broadcast("p"), &opts)
            .await;
        assert_eq!(result.agents[0].id, "validate-validator-0-rerun");
    }

    #[tokio::test]
    async fn test_worktree_per_agent_and_cleanup() {
        if which::which("git").is_err() {
            return;
        }
        let repo_dir = tempfile::tempdir().unwrap();
        let wt_root = tempfile::tempdir().unwrap();
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg("git init -q && git -c user.name=t -c user.email=t@e commit -q --allow-empty -m init")
            .current_dir(repo_dir.path())
            .status()
            .unwrap();
        assert!(status.success());

        let spawner = Arc::new(MockSpawner::echo());
        let runner = StageRunner::new(
            spawner.clone(),
            Arc::new(OutputCache::new()),
            Arc::new(AgreementScorer::new()),
            Arc::new(WorktreeManager::new(wt_root.path().join("worktrees"))),
            Arc::new(ResolvedProviders::from_ids(["alpha"])),
            Arc::new(RunContext::new()),
            EventSink::disabled(),
        );

        let mut opts = StageOptions::new(repo_dir.path());
        opts.use_worktrees = true;
        opts.stagger = Duration::from_millis(100);

        let result = runner
            .run_stage(Stage::Code, 2, &broadcast("p"), &opts)
            .await;

        let workdirs: Vec<PathBuf> = spawner.spawned().into_iter().map(|r| r.workdir).collect();
        assert_eq!(workdirs.len(), 2);
        assert_ne!(workdirs[0], workdirs[1]);
        for agent in &result.agents {
            let worktree = agent.worktree.as_ref().unwrap();
            assert!(!worktree.exists(), "worktree removed after the stage");
        }
    }

    #[tokio::test]
    async fn test_worktree_failure_falls_back_to_project_dir() {
        if which::which("git").is_err() {
            return;
        }
        // No commits, so `worktree add ... HEAD` has nothing to check out
        let repo_dir = tempfile::tempdir().unwrap();
        let wt_root = tempfile::tempdir().unwrap();
        let status = std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(repo_dir.path())
            .status()
            .unwrap();
        assert!(status.success());
        assert!(WorktreeManager::is_git_repo(repo_dir.path()));

        let spawner = Arc::new(MockSpawner::echo());
        let runner = StageRunner::new(
            spawner.clone(),
            Arc::new(OutputCache::new()),
            Arc::new(AgreementScorer::new()),
            Arc::new(WorktreeManager::new(wt_root.path().join("worktrees"))),
            Arc::new(ResolvedProviders::from_ids(["alpha"])),
            Arc::new(RunContext::new()),
            EventSink::disabled(),
        );

        let mut opts = StageOptions::new(repo_dir.path());
        opts.use_worktrees = true;
        opts.stagger = Duration::from_millis(5);

        let result = runner
            .run_stage(Stage::Code, 2, &broadcast("p"), &opts)
            .await;

        assert_eq!(result.agents.len(), 2);
        for agent in &result.agents {
            assert_eq!(agent.status, AgentStatus::Completed);
            assert!(agent.worktree.is_none());
        }
        let spawned = spawner.spawned();
        assert_eq!(spawned.len(), 2);
        for request in spawned {
            assert_eq!(request.workdir.as_path(), repo_dir.path());
        }
    }
}
