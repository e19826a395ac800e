//! # Tools
//!
//! Deterministic helpers the pipeline calls around the LLM workers.
//!
//! ## Modules
//!
//! - `git` - Worktree isolation and diff summaries
//! - `security` - Static pattern checks for the SECURITY stage

pub mod git;
pub mod security;

pub use git::WorktreeManager;
pub use security::{PatternSecurityChecker, SecurityCheck, SecurityChecker, SecurityReport};
