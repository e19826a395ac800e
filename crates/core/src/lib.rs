//! # Hivemind Core
//!
//! The "Engine" of the Hivemind system - runs a swarm of coding-agent
//! worker processes through a staged pipeline and decides what to return.
//!
//! ## Architecture
//!
//! - `models` - Worker provider configuration and resolution
//! - `state/` - SQLite persistence (cache, tickets, evidence, settings, run history)
//! - `swarm/` - Stage runner, selection, guardrails and the pipeline orchestrator
//! - `tools/` - Deterministic helpers (git worktrees, static security checks)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hivemind_core::state::{HivemindDb, SwarmSettings};
//! use hivemind_core::swarm::{Orchestrator, SwarmOptions};
//!
//! let db = Arc::new(HivemindDb::open()?);
//! let settings = SwarmSettings::load(&db).unwrap_or_default();
//! let orchestrator = Orchestrator::new(settings, db)?;
//! let result = orchestrator
//!     .run_swarm_pipeline(SwarmOptions::new("Refactor the authentication module"))
//!     .await;
//! ```

pub mod models;
pub mod state;
pub mod swarm;
pub mod tools;
