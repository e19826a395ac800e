//! # Swarm Orchestration
//!
//! Runs coding-agent workers through the staged pipeline.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Research → Plan → Code → Validate (rerun once) → Security → Synthesize → Guardrail
//! ```
//!
//! Chat mode runs a single CODE worker. Project mode replaces the fan-out
//! with a sequence of tickets decomposed from the plan.

pub mod agent;
pub mod cache;
pub mod context;
pub mod decomposer;
pub mod events;
pub mod guardrail;
pub mod mode;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod runner;
pub mod scoring;
pub mod selector;
pub mod worker;

pub use agent::{AgentInstance, AgentStatus, StageResult};
pub use cache::{CacheStats, OutputCache};
pub use context::RunContext;
pub use decomposer::{decompose_task, TicketDecomposer, TicketDraft};
pub use events::{EventSink, SwarmEvent, SwarmEventKind};
pub use guardrail::{GuardrailConfig, GuardrailDecision, GuardrailPolicy, RefusalPayload};
pub use mode::{detect_mode, SwarmMode};
pub use orchestrator::{LastRun, Orchestrator, PipelineBusy, RunOutcome, SwarmOptions, SwarmResult};
pub use pipeline::{Pipeline, PipelineState, Role, Stage};
pub use prompts::PromptLibrary;
pub use runner::{StageOptions, StagePrompts, StageRunner};
pub use scoring::{AgreementScorer, ConfidenceScorer};
pub use selector::{select_best_output, AntiHallucinationSelector, StageAnalysis};
pub use worker::{ProcessSpawner, WorkerError, WorkerSpawner};
