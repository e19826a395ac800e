//! # Pipeline Orchestrator
//!
//! Top-level entry point: resolves providers, picks a mode and drives either
//! a single chat worker, the six-stage swarm pipeline or the ticket-driven
//! project pipeline, then applies the confidence floor and the guardrail.
//!
//! Only one run is active at a time. Cancellation is checked at every stage
//! boundary (and before every ticket); a cancelled run returns immediately
//! with confidence 0 while live workers are killed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

use super::agent::{AgentInstance, StageResult};
use super::cache::OutputCache;
use super::context::RunContext;
use super::decomposer::TicketDecomposer;
use super::events::{EventSink, SwarmEvent, SwarmEventKind, SYSTEM_AGENT};
use super::guardrail::{
    below_absolute_floor, format_refusal, GuardrailContext, GuardrailInput, GuardrailPolicy,
    REFUSED_OUTPUT,
};
use super::mode::{resolve_mode, SwarmMode};
use super::pipeline::{Pipeline, PipelineState, Stage};
use super::prompts::PromptLibrary;
use super::runner::{StageOptions, StagePrompts, StageRunner};
use super::scoring::{AgreementScorer, ConfidenceScorer};
use super::selector::{select_best_output, AntiHallucinationSelector};
use super::worker::{ProcessSpawner, WorkerError, WorkerSpawner};
use crate::models::{resolve_providers, ResolvedProviders};
use crate::state::db::{HivemindDb, RunRecord};
use crate::state::evidence::{EvidenceLedger, EvidenceManager};
use crate::state::settings::{StageCounts, SwarmSettings};
use crate::state::tickets::{FailOutcome, TicketManager, TicketStore, MAX_TICKET_RETRIES};
use crate::tools::git::{diff_summary, WorktreeManager};
use crate::tools::security::{PatternSecurityChecker, SecurityChecker};

/// Confidence reported for chat mode
pub const CHAT_CONFIDENCE: u8 = 50;

/// System message emitted when continuous mode gives up
pub const MAX_ATTEMPTS_MESSAGE: &str = "max attempts reached";

/// What the caller asks for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmOptions {
    pub prompt: String,
    /// Forces a mode instead of detecting one
    #[serde(default)]
    pub mode: Option<SwarmMode>,
    #[serde(default = "default_project_path")]
    pub project_path: PathBuf,
    /// Overrides the configured per-stage counts
    #[serde(default)]
    pub counts: Option<StageCounts>,
    #[serde(default)]
    pub continuous: Option<bool>,
    #[serde(default)]
    pub use_worktrees: Option<bool>,
}

fn default_project_path() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl SwarmOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: None,
            project_path: default_project_path(),
            counts: None,
            continuous: None,
            use_worktrees: None,
        }
    }

    pub fn with_mode(mut self, mode: SwarmMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = path.into();
        self
    }

    pub fn with_counts(mut self, counts: StageCounts) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = Some(continuous);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
    Refused,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refused => "refused",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "refused" => Self::Refused,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmResult {
    pub final_output: String,
    pub confidence: u8,
    pub agents: Vec<AgentInstance>,
    pub sources: Vec<String>,
    pub validation_passed: bool,
    pub mode: SwarmMode,
    pub outcome: RunOutcome,
    /// System messages in emission order
    pub messages: Vec<String>,
    pub escalation_ticket: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Returned when a run is requested while another one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("another pipeline run is already in progress")]
pub struct PipelineBusy;

/// When the last run finished
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastRun {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
}

/// Result of one pass through the six stages
#[derive(Debug, Clone)]
struct AttemptResult {
    final_output: String,
    confidence: u8,
    sources: Vec<String>,
    validation_passed: bool,
}

enum Flow<T> {
    Continue(T),
    Cancelled,
}

/// Mutable state of the run in progress
struct PipelineRun {
    prompt: String,
    mode: SwarmMode,
    project_path: PathBuf,
    counts: StageCounts,
    continuous: bool,
    use_worktrees: bool,
    /// VALIDATE reruns at most once per run, across attempts
    validation_rerun_used: bool,
    pipeline: Pipeline,
    agents: Vec<AgentInstance>,
    messages: Vec<String>,
    events: EventSink,
}

impl PipelineRun {
    fn message(&mut self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("{}", text);
        self.events.emit(SwarmEvent::system(&text));
        self.messages.push(text);
    }

    fn transition(&mut self, next: PipelineState) -> anyhow::Result<()> {
        self.pipeline.transition(next)
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    settings: SwarmSettings,
    db: Arc<HivemindDb>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    providers_override: Option<ResolvedProviders>,
    scorer: Arc<dyn ConfidenceScorer>,
    security: Arc<dyn SecurityChecker>,
    tickets: Arc<dyn TicketStore>,
    evidence: Arc<dyn EvidenceLedger>,
    cache: Arc<OutputCache>,
    worktrees: Arc<WorktreeManager>,
    prompts: PromptLibrary,
    guardrail: GuardrailPolicy,
    context: Arc<RunContext>,
    events: EventSink,
    last_run: Mutex<Option<LastRun>>,
    running: AtomicBool,
}

impl Orchestrator {
    /// Orchestrator backed by `db` for cache, tickets, evidence, prompts and history
    pub fn new(settings: SwarmSettings, db: Arc<HivemindDb>) -> anyhow::Result<Self> {
        db.seed_prompts()?;
        let cache = if settings.persist_cache {
            OutputCache::with_db(Arc::clone(&db))?
        } else {
            OutputCache::new()
        };

        Ok(Self {
            prompts: PromptLibrary::from_db(&db),
            tickets: Arc::new(TicketManager::new(&db)),
            evidence: Arc::new(EvidenceManager::new(&db)),
            cache: Arc::new(cache),
            settings,
            db,
            spawner: None,
            providers_override: None,
            scorer: Arc::new(AgreementScorer::new()),
            security: Arc::new(PatternSecurityChecker::default()),
            worktrees: Arc::new(WorktreeManager::default()),
            guardrail: GuardrailPolicy::new(),
            context: Arc::new(RunContext::new()),
            events: EventSink::disabled(),
            last_run: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Skip PATH resolution and use these providers
    pub fn with_providers(mut self, providers: ResolvedProviders) -> Self {
        self.providers_override = Some(providers);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_security_checker(mut self, checker: Arc<dyn SecurityChecker>) -> Self {
        self.security = checker;
        self
    }

    pub fn with_ticket_store(mut self, store: Arc<dyn TicketStore>) -> Self {
        self.tickets = store;
        self
    }

    pub fn with_evidence_ledger(mut self, ledger: Arc<dyn EvidenceLedger>) -> Self {
        self.evidence = ledger;
        self
    }

    pub fn with_worktree_manager(mut self, worktrees: WorktreeManager) -> Self {
        self.worktrees = Arc::new(worktrees);
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<SwarmEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn settings(&self) -> &SwarmSettings {
        &self.settings
    }

    pub fn context(&self) -> Arc<RunContext> {
        Arc::clone(&self.context)
    }

    pub fn tickets(&self) -> Arc<dyn TicketStore> {
        Arc::clone(&self.tickets)
    }

    pub fn cache(&self) -> Arc<OutputCache> {
        Arc::clone(&self.cache)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel the active run. Returns how many live workers were signalled.
    pub fn cancel_swarm(&self) -> usize {
        let killed = self.context.cancel();
        tracing::info!(killed, "Swarm cancellation requested");
        killed
    }

    /// When the last run finished, from memory or run history
    pub fn last_pipeline_run_time(&self) -> Option<LastRun> {
        if let Some(last) = self.last_run.lock().ok().and_then(|l| l.clone()) {
            return Some(last);
        }

        match self.db.last_run() {
            Ok(record) => record.map(|r| LastRun {
                finished_at: r.finished_at,
                duration_ms: r.duration_ms,
                outcome: RunOutcome::from_str(&r.outcome),
            }),
            Err(e) => {
                tracing::warn!("Failed to read run history: {}", e);
                None
            }
        }
    }

    /// Run one pipeline. Never fails: every error becomes a failed result,
    /// including a call made while another run is active.
    pub async fn run_swarm_pipeline(&self, options: SwarmOptions) -> SwarmResult {
        let mode = options.mode.unwrap_or_default();
        match self.try_run_swarm_pipeline(options).await {
            Ok(result) => result,
            Err(busy) => SwarmResult {
                final_output: busy.to_string(),
                confidence: 0,
                agents: Vec::new(),
                sources: Vec::new(),
                validation_passed: false,
                mode,
                outcome: RunOutcome::Failed,
                messages: Vec::new(),
                escalation_ticket: None,
                attempts: 0,
                duration_ms: 0,
            },
        }
    }

    /// Run one pipeline unless another is already active. Claiming the run
    /// slot is atomic, so of two concurrent callers exactly one gets `Busy`.
    #[tracing::instrument(skip_all, fields(requested_mode = ?options.mode))]
    pub async fn try_run_swarm_pipeline(
        &self,
        options: SwarmOptions,
    ) -> Result<SwarmResult, PipelineBusy> {
        let started_at = Utc::now();
        let clock = Instant::now();

        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Rejected run: another pipeline is active");
            return Err(PipelineBusy);
        }
        let _guard = RunGuard(&self.running);
        self.context.reset();

        let mut run = PipelineRun {
            prompt: options.prompt.clone(),
            mode: options.mode.unwrap_or_default(),
            project_path: options.project_path.clone(),
            counts: options.counts.unwrap_or(self.settings.counts),
            continuous: options.continuous.unwrap_or(self.settings.continuous_mode),
            use_worktrees: options.use_worktrees.unwrap_or(self.settings.use_worktrees),
            validation_rerun_used: false,
            pipeline: Pipeline::new(self.settings.max_attempts),
            agents: Vec::new(),
            messages: Vec::new(),
            events: self.events.clone(),
        };

        self.events.emit(
            SwarmEvent::new(SwarmEventKind::PipelineStarted, SYSTEM_AGENT)
                .with_data(json!({ "prompt": options.prompt })),
        );

        let mut result = match self.execute(&options, &mut run).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Pipeline failed: {:#}", e);
                let _ = run.transition(PipelineState::Failed);
                let message = format!("Pipeline failed: {:#}", e);
                run.message(message.clone());
                self.finish(&mut run, RunOutcome::Failed, message, 0, Vec::new(), false)
            }
        };

        result.duration_ms = clock.elapsed().as_millis() as u64;
        self.record(&run, &result, started_at);

        let kind = match result.outcome {
            RunOutcome::Completed => SwarmEventKind::PipelineCompleted,
            RunOutcome::Cancelled => SwarmEventKind::PipelineCancelled,
            RunOutcome::Refused => SwarmEventKind::GuardrailRefused,
            RunOutcome::Failed => SwarmEventKind::PipelineFailed,
        };
        self.events.emit(SwarmEvent::new(kind, SYSTEM_AGENT).with_data(json!({
            "outcome": result.outcome,
            "confidence": result.confidence,
            "validation_passed": result.validation_passed,
            "duration_ms": result.duration_ms,
        })));

        Ok(result)
    }

    async fn execute(
        &self,
        options: &SwarmOptions,
        run: &mut PipelineRun,
    ) -> anyhow::Result<SwarmResult> {
        run.transition(PipelineState::ResolvingProviders)?;
        let providers = match &self.providers_override {
            Some(providers) => providers.clone(),
            None => resolve_providers(
                &self.settings.providers,
                self.settings.fallback_command.as_ref(),
            ),
        };
        if providers.is_empty() {
            return Err(WorkerError::NoProviders.into());
        }
        run.message(format!("Providers: {}", providers.ids().join(", ")));

        let spawner: Arc<dyn WorkerSpawner> = match &self.spawner {
            Some(spawner) => Arc::clone(spawner),
            None => Arc::new(ProcessSpawner::new(providers.clone())),
        };
        let runner = StageRunner::new(
            spawner,
            Arc::clone(&self.cache),
            Arc::clone(&self.scorer),
            Arc::clone(&self.worktrees),
            Arc::new(providers),
            Arc::clone(&self.context),
            self.events.clone(),
        );

        run.transition(PipelineState::ModeDispatch)?;
        run.mode = resolve_mode(&options.prompt, options.mode);
        tracing::Span::current().record("requested_mode", run.mode.as_str());
        run.message(format!("Mode: {}", run.mode.as_str()));

        if self.context.is_cancelled() {
            return self.cancelled(run);
        }

        run.transition(PipelineState::Running(run.mode))?;
        match run.mode {
            SwarmMode::Chat => self.run_chat(run, &runner).await,
            SwarmMode::Swarm => self.run_swarm(run, &runner).await,
            SwarmMode::Project => self.run_project(run, &runner).await,
        }
    }

    fn stage_options(&self, run: &PipelineRun, stage: Stage, suffix: Option<String>) -> StageOptions {
        let mut options = StageOptions::from_settings(&self.settings, &run.project_path);
        options.use_worktrees = run.use_worktrees && stage == Stage::Code;
        options.with_suffix(suffix)
    }

    async fn stage(
        &self,
        run: &mut PipelineRun,
        runner: &StageRunner,
        stage: Stage,
        count: usize,
        prompts: StagePrompts,
        suffix: Option<String>,
    ) -> StageResult {
        let options = self.stage_options(run, stage, suffix);
        let result = runner.run_stage(stage, count, &prompts, &options).await;
        run.agents.extend(result.agents.iter().cloned());
        result
    }

    // =========================================================================
    // Chat
    // =========================================================================

    async fn run_chat(
        &self,
        run: &mut PipelineRun,
        runner: &StageRunner,
    ) -> anyhow::Result<SwarmResult> {
        let prompt = StagePrompts::Broadcast(run.prompt.clone());
        let mut options = self.stage_options(run, Stage::Code, None);
        options.use_worktrees = false;

        let result = runner.run_stage(Stage::Code, 1, &prompt, &options).await;
        run.agents.extend(result.agents.iter().cloned());

        if self.context.is_cancelled() {
            return self.cancelled(run);
        }

        let output = select_best_output(&result.successful_outputs());
        let sources = self.scorer.extract_sources(&output);

        if output.trim().is_empty() {
            let reason = result
                .agents
                .first()
                .and_then(|a| a.error.clone())
                .unwrap_or_else(|| "worker produced no output".to_string());
            run.transition(PipelineState::Failed)?;
            return Ok(self.finish(
                run,
                RunOutcome::Failed,
                format!("No output produced: {}", reason),
                CHAT_CONFIDENCE,
                sources,
                true,
            ));
        }

        run.transition(PipelineState::Completed)?;
        Ok(self.finish(run, RunOutcome::Completed, output, CHAT_CONFIDENCE, sources, true))
    }

    // =========================================================================
    // Swarm
    // =========================================================================

    async fn run_swarm(
        &self,
        run: &mut PipelineRun,
        runner: &StageRunner,
    ) -> anyhow::Result<SwarmResult> {
        let threshold = self.settings.auto_rerun_threshold;
        let mut best: Option<AttemptResult> = None;

        loop {
            if !run.pipeline.begin_attempt() {
                run.message(MAX_ATTEMPTS_MESSAGE);
                break;
            }

            let attempt = run.pipeline.attempts;
            if attempt > 1 {
                run.message(format!(
                    "Attempt {}/{}: confidence below {}%, restarting pipeline",
                    attempt, run.pipeline.max_attempts, threshold
                ));
            }

            let result = match self.swarm_attempt(run, runner, attempt).await? {
                Flow::Continue(result) => result,
                Flow::Cancelled => return self.cancelled(run),
            };

            let confident = result.confidence >= threshold;
            if best
                .as_ref()
                .map_or(true, |b| result.confidence > b.confidence)
            {
                best = Some(result);
            }

            if !run.continuous || confident {
                break;
            }
        }

        let Some(best) = best else {
            anyhow::bail!("Swarm pipeline produced no attempt");
        };

        if below_absolute_floor(best.confidence, &best.sources) {
            run.message(format!(
                "Confidence {}% is below the absolute floor with no sources, refusing",
                best.confidence
            ));
            run.transition(PipelineState::Refused)?;
            return Ok(self.finish(
                run,
                RunOutcome::Refused,
                REFUSED_OUTPUT.to_string(),
                best.confidence,
                best.sources,
                false,
            ));
        }

        run.transition(PipelineState::GuardrailCheck)?;
        let evidence = best.sources.clone();
        self.apply_guardrail(run, best, &evidence, None)
    }

    async fn swarm_attempt(
        &self,
        run: &mut PipelineRun,
        runner: &StageRunner,
        attempt: u32,
    ) -> anyhow::Result<Flow<AttemptResult>> {
        let suffix = (attempt > 1).then(|| format!("attempt{}", attempt));
        let prompt = run.prompt.clone();
        let counts = run.counts;
        let selector = AntiHallucinationSelector::new(Arc::clone(&self.scorer));
        let mut all_outputs: Vec<String> = Vec::new();

        // RESEARCH
        if self.context.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        run.message(Stage::Research.banner());
        let research = self
            .stage(
                run,
                runner,
                Stage::Research,
                counts.get(Stage::Research),
                StagePrompts::Broadcast(self.prompts.research_prompt(&prompt)),
                suffix.clone(),
            )
            .await;
        all_outputs.extend(research.non_empty_outputs());

        // PLAN
        if self.context.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        run.message(Stage::Plan.banner());
        let plan = self
            .stage(
                run,
                runner,
                Stage::Plan,
                counts.get(Stage::Plan),
                StagePrompts::Broadcast(
                    self.prompts.plan_prompt(&prompt, &research.combined_output),
                ),
                suffix.clone(),
            )
            .await;
        let best_plan = select_best_output(&plan.successful_outputs());
        all_outputs.extend(plan.non_empty_outputs());

        // CODE
        if self.context.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        run.message(Stage::Code.banner());
        let code = self
            .stage(
                run,
                runner,
                Stage::Code,
                counts.get(Stage::Code),
                StagePrompts::PerAgent(self.prompts.code_prompts(&prompt, &best_plan, counts.code)),
                suffix.clone(),
            )
            .await;
        all_outputs.extend(code.non_empty_outputs());

        // VALIDATE
        if self.context.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        run.message(Stage::Validate.banner());
        let validate_prompt =
            StagePrompts::Broadcast(self.prompts.validate_prompt(&prompt, &code.combined_output));
        let validate = self
            .stage(
                run,
                runner,
                Stage::Validate,
                counts.get(Stage::Validate),
                validate_prompt.clone(),
                suffix.clone(),
            )
            .await;
        let threshold = self.settings.validation_threshold;
        let mut validation_outputs = validate.successful_outputs();
        let analysis = selector.analyze_stage_outputs(&validation_outputs, threshold);

        let rerun = !run.validation_rerun_used
            && counts.validate > 0
            && selector.should_rerun_validation(&analysis, threshold);
        let analysis = if rerun {
            if self.context.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            run.validation_rerun_used = true;
            run.message(format!(
                "Validation confidence {}% is below {}%, rerunning VALIDATE once",
                analysis.confidence, threshold
            ));
            self.events.emit(
                SwarmEvent::new(SwarmEventKind::ValidationRerun, Stage::Validate.as_str())
                    .with_data(json!({ "confidence": analysis.confidence, "threshold": threshold })),
            );
            let rerun_suffix = match &suffix {
                Some(s) => format!("{}-rerun", s),
                None => "rerun".to_string(),
            };
            let rerun = self
                .stage(
                    run,
                    runner,
                    Stage::Validate,
                    counts.get(Stage::Validate),
                    validate_prompt,
                    Some(rerun_suffix),
                )
                .await;
            validation_outputs.extend(rerun.successful_outputs());
            selector.analyze_stage_outputs(&validation_outputs, threshold)
        } else {
            analysis
        };
        let validation_ok = counts.validate == 0
            || (analysis.confidence >= threshold && !reports_failure(&validation_outputs));
        all_outputs.extend(
            validation_outputs
                .iter()
                .filter(|o| !o.trim().is_empty())
                .cloned(),
        );

        // SECURITY
        if self.context.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        run.message(Stage::Security.banner());
        let (security_passed, findings) = self.static_security(run).await;
        let security = self
            .stage(
                run,
                runner,
                Stage::Security,
                counts.get(Stage::Security),
                StagePrompts::Broadcast(self.prompts.security_prompt(
                    &prompt,
                    &code.combined_output,
                    &findings,
                )),
                suffix.clone(),
            )
            .await;
        all_outputs.extend(security.non_empty_outputs());

        // SYNTHESIZE
        if self.context.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        run.message(Stage::Synthesize.banner());
        let running_confidence = self.scorer.compute_confidence(&all_outputs);
        let context = [
            ("Research", research.combined_output.as_str()),
            ("Plan", best_plan.as_str()),
            ("Code", code.combined_output.as_str()),
            ("Validation", analysis.best_output.as_str()),
            ("Security", security.combined_output.as_str()),
        ]
        .iter()
        .filter(|(_, body)| !body.trim().is_empty())
        .map(|(title, body)| format!("## {}\n\n{}", title, body))
        .collect::<Vec<_>>()
        .join("\n\n");
        let synthesize = self
            .stage(
                run,
                runner,
                Stage::Synthesize,
                counts.get(Stage::Synthesize),
                StagePrompts::Broadcast(self.prompts.synthesize_prompt(
                    &prompt,
                    &context,
                    running_confidence,
                )),
                suffix,
            )
            .await;
        all_outputs.extend(synthesize.non_empty_outputs());

        if self.context.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let final_output = [
            select_best_output(&synthesize.successful_outputs()),
            select_best_output(&code.successful_outputs()),
            select_best_output(&all_outputs),
        ]
        .into_iter()
        .find(|o| !o.trim().is_empty())
        .unwrap_or_default();

        let confidence = self.scorer.compute_confidence(&all_outputs);
        let sources = self.collect_sources(&all_outputs);
        run.message(format!(
            "Attempt {} finished: confidence {}%, {} source(s)",
            attempt,
            confidence,
            sources.len()
        ));

        Ok(Flow::Continue(AttemptResult {
            final_output,
            confidence,
            sources,
            validation_passed: validation_ok && security_passed,
        }))
    }

    /// Static checker; errors fail open
    async fn static_security(&self, run: &mut PipelineRun) -> (bool, String) {
        match self.security.run_security_checks(&run.project_path).await {
            Ok(report) => {
                let failed = report.checks.iter().filter(|c| !c.passed).count();
                run.message(format!(
                    "Security checks: {} ({} of {} failed)",
                    if report.passed { "passed" } else { "failed" },
                    failed,
                    report.checks.len()
                ));
                (report.passed, report.summary())
            }
            Err(e) => {
                run.message(format!(
                    "Security checks errored, continuing without them: {:#}",
                    e
                ));
                (true, String::new())
            }
        }
    }

    fn collect_sources(&self, outputs: &[String]) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        for output in outputs {
            for source in self.scorer.extract_sources(output) {
                if !sources.contains(&source) {
                    sources.push(source);
                }
            }
        }
        sources
    }

    // =========================================================================
    // Project
    // =========================================================================

    async fn run_project(
        &self,
        run: &mut PipelineRun,
        runner: &StageRunner,
    ) -> anyhow::Result<SwarmResult> {
        let prompt = run.prompt.clone();
        let counts = run.counts;
        let selector = AntiHallucinationSelector::new(Arc::clone(&self.scorer));
        let decomposer = TicketDecomposer::new(Arc::clone(&self.tickets));
        let mut all_outputs: Vec<String> = Vec::new();

        run.message(Stage::Plan.banner());
        let plan = self
            .stage(
                run,
                runner,
                Stage::Plan,
                counts.plan.max(1),
                StagePrompts::Broadcast(self.prompts.plan_prompt(&prompt, "")),
                None,
            )
            .await;
        let best_plan = select_best_output(&plan.successful_outputs());
        all_outputs.extend(plan.non_empty_outputs());

        if self.context.is_cancelled() {
            return self.cancelled(run);
        }

        let tickets = decomposer.decompose(&prompt, &best_plan, self.settings.max_tickets)?;
        run.message(format!("Decomposed into {} ticket(s)", tickets.len()));

        let project_dir = run.project_path.to_string_lossy().to_string();
        let evidence_id = match self.evidence.create_pipeline_evidence(&project_dir) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to open evidence record: {:#}", e);
                None
            }
        };

        let mut ticket_outputs: Vec<String> = Vec::new();
        let mut summary: Vec<String> = Vec::new();
        let mut escalation: Option<String> = None;
        let total = tickets.len();

        for (index, ticket) in tickets.iter().enumerate() {
            if self.context.is_cancelled() {
                return self.cancelled(run);
            }
            run.message(format!("Ticket {}/{}: {}", index + 1, total, ticket.title));
            decomposer.start_ticket(&ticket.id)?;

            let ticket_prompt = self.prompts.ticket_prompt(&prompt, ticket, index, total);
            let mut retry = 0;
            loop {
                let suffix = if retry == 0 {
                    format!("t{}", index + 1)
                } else {
                    format!("t{}-retry{}", index + 1, retry)
                };
                let mut options = self.stage_options(run, Stage::Code, Some(suffix));
                // Tickets build on each other in the shared tree
                options.use_worktrees = false;

                let result = runner
                    .run_stage(
                        Stage::Code,
                        1,
                        &StagePrompts::Broadcast(ticket_prompt.clone()),
                        &options,
                    )
                    .await;
                run.agents.extend(result.agents.iter().cloned());

                if self.context.is_cancelled() {
                    return self.cancelled(run);
                }

                let agent = result.agents.first();
                let output = result.non_empty_outputs().into_iter().next();
                if let Some(output) = output {
                    decomposer.complete_ticket(&ticket.id)?;
                    if let Some(evidence_id) = &evidence_id {
                        let source = agent.map(|a| a.id.as_str()).unwrap_or("ticket");
                        self.record_evidence(evidence_id, &ticket.id, source, &output);
                    }
                    summary.push(format!("- [done] {}", ticket.title));
                    ticket_outputs.push(output);
                    break;
                }

                let reason = agent
                    .and_then(|a| a.error.clone())
                    .unwrap_or_else(|| "worker produced no output".to_string());
                match decomposer.fail_ticket(&ticket.id, &reason)? {
                    FailOutcome::Retry { retry_count } => {
                        retry = retry_count;
                        run.message(format!(
                            "Ticket {} failed ({}), retry {}/{}",
                            index + 1,
                            reason,
                            retry_count,
                            MAX_TICKET_RETRIES - 1
                        ));
                    }
                    FailOutcome::Escalated { escalation: ticket_escalation, .. } => {
                        run.message(format!(
                            "Ticket {} escalated as {}",
                            index + 1,
                            ticket_escalation.id
                        ));
                        self.events.emit(
                            SwarmEvent::new(SwarmEventKind::EscalationCreated, SYSTEM_AGENT)
                                .with_data(json!({ "ticket_id": ticket_escalation.id })),
                        );
                        summary.push(format!("- [escalated] {}", ticket.title));
                        escalation.get_or_insert(ticket_escalation.id);
                        break;
                    }
                }
            }
        }
        all_outputs.extend(ticket_outputs.iter().cloned());

        // VALIDATE, once over everything the tickets produced
        if self.context.is_cancelled() {
            return self.cancelled(run);
        }
        run.message(Stage::Validate.banner());
        let accumulated = ticket_outputs.join("\n\n---\n\n");
        let validate = self
            .stage(
                run,
                runner,
                Stage::Validate,
                counts.get(Stage::Validate),
                StagePrompts::Broadcast(self.prompts.validate_prompt(&prompt, &accumulated)),
                None,
            )
            .await;
        let threshold = self.settings.validation_threshold;
        let validation_outputs = validate.successful_outputs();
        let analysis = selector.analyze_stage_outputs(&validation_outputs, threshold);
        let validation_ok = counts.validate == 0
            || (analysis.confidence >= threshold && !reports_failure(&validation_outputs));
        all_outputs.extend(validate.non_empty_outputs());

        // SECURITY
        if self.context.is_cancelled() {
            return self.cancelled(run);
        }
        run.message(Stage::Security.banner());
        let (security_passed, findings) = self.static_security(run).await;
        let security = self
            .stage(
                run,
                runner,
                Stage::Security,
                counts.get(Stage::Security),
                StagePrompts::Broadcast(self.prompts.security_prompt(
                    &prompt,
                    &accumulated,
                    &findings,
                )),
                None,
            )
            .await;
        all_outputs.extend(security.non_empty_outputs());

        if self.context.is_cancelled() {
            return self.cancelled(run);
        }

        let mut evidence: Vec<String> = Vec::new();
        if let Some(evidence_id) = &evidence_id {
            self.record_diff(evidence_id, &run.project_path);
            match self.evidence.entries(evidence_id) {
                Ok(entries) => evidence.extend(entries.into_iter().map(|e| e.content)),
                Err(e) => tracing::warn!("Failed to read evidence entries: {:#}", e),
            }
        }

        let confidence = self.scorer.compute_confidence(&all_outputs);
        let sources = self.collect_sources(&all_outputs);
        evidence.extend(sources.iter().cloned());

        let mut final_output = format!("## Tickets\n\n{}", summary.join("\n"));
        if !accumulated.trim().is_empty() {
            final_output.push_str(&format!("\n\n## Work\n\n{}", accumulated));
        }
        if !analysis.best_output.trim().is_empty() {
            final_output.push_str(&format!("\n\n## Validation\n\n{}", analysis.best_output));
        }

        run.transition(PipelineState::GuardrailCheck)?;
        let candidate = AttemptResult {
            final_output,
            confidence,
            sources,
            validation_passed: validation_ok && security_passed && escalation.is_none(),
        };
        self.apply_guardrail(run, candidate, &evidence, escalation)
    }

    fn record_evidence(&self, evidence_id: &str, ticket_id: &str, source: &str, output: &str) {
        if let Err(e) = self.evidence.append_cli_excerpt(evidence_id, source, output) {
            tracing::warn!(ticket_id = %ticket_id, "Failed to append evidence: {:#}", e);
        }
        if let Err(e) = self.evidence.link_ticket_to_evidence(ticket_id, evidence_id) {
            tracing::warn!(ticket_id = %ticket_id, "Failed to link evidence: {:#}", e);
        }
    }

    fn record_diff(&self, evidence_id: &str, project_path: &Path) {
        if !WorktreeManager::is_git_repo(project_path) {
            return;
        }
        match diff_summary(project_path) {
            Ok(summary) => {
                if let Err(e) = self.evidence.append_diff_summary(evidence_id, &summary) {
                    tracing::warn!("Failed to append diff summary: {:#}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to summarize diff: {:#}", e),
        }
    }

    // =========================================================================
    // Outcome
    // =========================================================================

    fn apply_guardrail(
        &self,
        run: &mut PipelineRun,
        candidate: AttemptResult,
        evidence: &[String],
        escalation: Option<String>,
    ) -> anyhow::Result<SwarmResult> {
        let config = self.settings.guardrail;
        let decision = self.guardrail.evaluate(&GuardrailInput {
            min_confidence: config.min_confidence,
            min_evidence_count: config.min_evidence_count,
            confidence: candidate.confidence,
            evidence,
            candidate_output: &candidate.final_output,
            upstream_validation_passed: candidate.validation_passed,
            context: GuardrailContext {
                pipeline: format!("{} pipeline", run.mode.as_str()),
                mode: run.mode,
                prompt: run.prompt.clone(),
            },
        });

        let refusal = match decision.refusal {
            Some(refusal) if !decision.passed => refusal,
            _ => {
                run.message(format!("Guardrail passed at {}% confidence", candidate.confidence));
                run.transition(PipelineState::Completed)?;
                let mut result = self.finish(
                    run,
                    RunOutcome::Completed,
                    candidate.final_output,
                    candidate.confidence,
                    candidate.sources,
                    candidate.validation_passed,
                );
                result.escalation_ticket = escalation;
                return Ok(result);
            }
        };

        let message = format_refusal(&refusal);
        run.message(format!(
            "Guardrail refused the result at {}% confidence",
            candidate.confidence
        ));

        let context = format!(
            "{}\n\n---\n\nCandidate output:\n\n{}",
            message, candidate.final_output
        );
        let escalation = match self.tickets.create_escalation(
            None,
            &format!("Guardrail refusal: {}", refusal.prompt.lines().next().unwrap_or("")),
            &context,
        ) {
            Ok(ticket) => {
                self.events.emit(
                    SwarmEvent::new(SwarmEventKind::EscalationCreated, SYSTEM_AGENT)
                        .with_data(json!({ "ticket_id": ticket.id })),
                );
                Some(ticket.id)
            }
            Err(e) => {
                tracing::error!("Failed to create escalation ticket: {:#}", e);
                escalation
            }
        };

        run.transition(PipelineState::Refused)?;
        let mut result = self.finish(
            run,
            RunOutcome::Refused,
            message,
            candidate.confidence,
            candidate.sources,
            false,
        );
        result.escalation_ticket = escalation;
        Ok(result)
    }

    fn cancelled(&self, run: &mut PipelineRun) -> anyhow::Result<SwarmResult> {
        run.message("Pipeline cancelled");
        run.transition(PipelineState::Cancelled)?;
        Ok(self.finish(
            run,
            RunOutcome::Cancelled,
            "Pipeline cancelled".to_string(),
            0,
            Vec::new(),
            false,
        ))
    }

    fn finish(
        &self,
        run: &mut PipelineRun,
        outcome: RunOutcome,
        final_output: String,
        confidence: u8,
        sources: Vec<String>,
        validation_passed: bool,
    ) -> SwarmResult {
        SwarmResult {
            final_output,
            confidence,
            agents: std::mem::take(&mut run.agents),
            sources,
            validation_passed,
            mode: run.mode,
            outcome,
            messages: run.messages.clone(),
            escalation_ticket: None,
            attempts: run.pipeline.attempts,
            duration_ms: 0,
        }
    }

    fn record(&self, run: &PipelineRun, result: &SwarmResult, started_at: DateTime<Utc>) {
        let finished_at = Utc::now();
        let last = LastRun {
            finished_at,
            duration_ms: result.duration_ms,
            outcome: result.outcome,
        };
        if let Ok(mut slot) = self.last_run.lock() {
            *slot = Some(last);
        }

        let record = RunRecord {
            id: format!("run-{}", uuid::Uuid::new_v4().simple()),
            prompt: run.prompt.clone(),
            mode: result.mode.as_str().to_string(),
            outcome: result.outcome.as_str().to_string(),
            confidence: result.confidence,
            validation_passed: result.validation_passed,
            started_at,
            finished_at,
            duration_ms: result.duration_ms,
        };
        if let Err(e) = self.db.record_run(&record) {
            tracing::warn!("Failed to record pipeline run: {:#}", e);
        }

        let cache = self.cache.stats();
        tracing::info!(
            outcome = result.outcome.as_str(),
            duration_ms = result.duration_ms,
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            cache_hit_rate = cache.hit_rate(),
            "Pipeline run recorded"
        );
    }
}

/// Whether any validator reported an explicit failing verdict
fn reports_failure(outputs: &[String]) -> bool {
    outputs
        .iter()
        .any(|o| o.to_ascii_uppercase().contains("VERDICT: FAIL"))
}
