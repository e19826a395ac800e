//! Shared helpers for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hivemind_core::models::ResolvedProviders;
use hivemind_core::state::{HivemindDb, StageCounts, SwarmSettings};
use hivemind_core::swarm::worker::{
    KillHandle, WorkerError, WorkerEvent, WorkerHandle, WorkerRequest, WorkerSpawner,
    KILLED_EXIT_CODE,
};
use hivemind_core::swarm::{ConfidenceScorer, Orchestrator};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Canned worker behaviour
#[derive(Debug, Clone)]
pub struct Reply {
    pub output: String,
    pub exit_code: i32,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            output: String::new(),
            exit_code,
            delay: Duration::ZERO,
        }
    }
}

type Script = dyn Fn(&WorkerRequest) -> Reply + Send + Sync;

/// Records every spawn and replays whatever the script returns
pub struct ScriptedSpawner {
    script: Box<Script>,
    requests: Mutex<Vec<WorkerRequest>>,
}

impl ScriptedSpawner {
    pub fn new(script: impl Fn(&WorkerRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every worker answers with `"{agent_id} output"`
    pub fn echo() -> Self {
        Self::new(|req| Reply::ok(format!("{} output", req.agent_id)))
    }

    pub fn spawned_ids(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.agent_id.clone())
            .collect()
    }
}

#[async_trait]
impl WorkerSpawner for ScriptedSpawner {
    async fn spawn(&self, request: WorkerRequest) -> Result<WorkerHandle, WorkerError> {
        let reply = (self.script)(&request);
        self.requests.lock().unwrap().push(request);

        let (tx, rx) = mpsc::channel(16);
        let kill = KillHandle::new();
        let signal = kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(reply.delay) => {
                    if !reply.output.is_empty() {
                        let _ = tx.send(WorkerEvent::Output(reply.output)).await;
                    }
                    let _ = tx.send(WorkerEvent::Exit(reply.exit_code)).await;
                }
                _ = signal.killed() => {
                    let _ = tx.send(WorkerEvent::Exit(KILLED_EXIT_CODE)).await;
                }
            }
        });

        Ok(WorkerHandle { events: rx, kill })
    }
}

/// Scorer pinned to one value and no sources
pub struct FixedScorer(pub u8);

impl ConfidenceScorer for FixedScorer {
    fn compute_confidence(&self, _outputs: &[String]) -> u8 {
        self.0
    }

    fn extract_sources(&self, _text: &str) -> Vec<String> {
        Vec::new()
    }
}

pub fn settings() -> SwarmSettings {
    let mut settings = SwarmSettings::default();
    settings.counts = StageCounts::uniform(1);
    settings.stagger_ms = 0;
    settings.use_worktrees = false;
    settings
}

pub fn orchestrator(
    settings: SwarmSettings,
    db: Arc<HivemindDb>,
    spawner: Arc<ScriptedSpawner>,
) -> Orchestrator {
    Orchestrator::new(settings, db)
        .unwrap()
        .with_spawner(spawner)
        .with_providers(ResolvedProviders::from_ids(["mock"]))
}

pub fn memory_db() -> Arc<HivemindDb> {
    Arc::new(HivemindDb::open_in_memory().unwrap())
}
