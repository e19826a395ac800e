//! # Swarm Settings
//!
//! Pipeline tunables, persisted as a single JSON row in the `settings`
//! table. Unknown or missing fields fall back to their defaults.

use super::db::HivemindDb;
use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::models::{LaunchCommand, ProviderConfig};
use crate::swarm::guardrail::GuardrailConfig;
use crate::swarm::pipeline::Stage;

/// Worker count per swarm stage. Zero skips the stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageCounts {
    pub research: usize,
    pub plan: usize,
    pub code: usize,
    pub validate: usize,
    pub security: usize,
    pub synthesize: usize,
}

impl Default for StageCounts {
    fn default() -> Self {
        Self {
            research: 1,
            plan: 1,
            code: 2,
            validate: 1,
            security: 1,
            synthesize: 1,
        }
    }
}

impl StageCounts {
    /// Same count for every stage
    pub fn uniform(count: usize) -> Self {
        Self {
            research: count,
            plan: count,
            code: count,
            validate: count,
            security: count,
            synthesize: count,
        }
    }

    pub fn get(&self, stage: Stage) -> usize {
        match stage {
            Stage::Research => self.research,
            Stage::Plan => self.plan,
            Stage::Code => self.code,
            Stage::Validate => self.validate,
            Stage::Security => self.security,
            Stage::Synthesize => self.synthesize,
        }
    }
}

/// Tunables for the swarm pipeline, persisted as one JSON row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSettings {
    /// Worker providers in round-robin order
    pub providers: Vec<ProviderConfig>,
    /// Command used when no provider is installed
    pub fallback_command: Option<LaunchCommand>,
    /// Workers per stage
    pub counts: StageCounts,
    /// Delay between successive agent starts within a stage
    pub stagger_ms: u64,
    /// Sequential worker invocations per agent
    pub chats_per_agent: u32,
    /// Hard limit for one worker invocation
    pub max_runtime_secs: u64,
    /// Give each CODE agent its own git worktree
    pub use_worktrees: bool,
    /// Restart the whole swarm pipeline while confidence stays low
    pub continuous_mode: bool,
    /// Attempt limit for continuous mode
    pub max_attempts: u32,
    /// Final confidence below this triggers a continuous-mode restart
    pub auto_rerun_threshold: u8,
    /// VALIDATE confidence below this triggers its one-shot rerun
    pub validation_threshold: u8,
    pub guardrail: GuardrailConfig,
    /// Write cache entries through to SQLite
    pub persist_cache: bool,
    /// Upper bound on tickets produced by project-mode decomposition
    pub max_tickets: usize,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            providers: ProviderConfig::defaults(),
            fallback_command: None,
            counts: StageCounts::default(),
            stagger_ms: 200,
            chats_per_agent: 1,
            max_runtime_secs: 600,
            use_worktrees: true,
            continuous_mode: false,
            max_attempts: 3,
            auto_rerun_threshold: 70,
            validation_threshold: 60,
            guardrail: GuardrailConfig::default(),
            persist_cache: true,
            max_tickets: 8,
        }
    }
}

impl SwarmSettings {
    /// Load settings from SQLite database
    pub fn load(db: &HivemindDb) -> Result<Self> {
        let conn = db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let result: Option<String> = conn
            .query_row("SELECT data FROM settings WHERE id = 1", [], |row| row.get(0))
            .ok();

        match result {
            Some(data) => Ok(serde_json::from_str(&data).context("Invalid stored settings")?),
            None => Ok(SwarmSettings::default()),
        }
    }

    /// Save settings to SQLite database
    pub fn save(&self, db: &HivemindDb) -> Result<()> {
        let conn = db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data = serde_json::to_string(self)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (id, data) VALUES (1, ?1)",
            params![data],
        )
        .context("Failed to save settings")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SwarmSettings::default();
        assert_eq!(settings.stagger_ms, 200);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.auto_rerun_threshold, 70);
        assert_eq!(settings.counts.get(Stage::Code), 2);
    }

    #[test]
    fn test_load_missing_returns_default() {
        let db = HivemindDb::open_in_memory().unwrap();
        let settings = SwarmSettings::load(&db).unwrap();
        assert_eq!(settings.max_tickets, 8);
    }

    #[test]
    fn test_save_and_load() {
        let db = HivemindDb::open_in_memory().unwrap();
        let mut settings = SwarmSettings::default();
        settings.continuous_mode = true;
        settings.counts = StageCounts::uniform(3);
        settings.save(&db).unwrap();

        let loaded = SwarmSettings::load(&db).unwrap();
        assert!(loaded.continuous_mode);
        assert_eq!(loaded.counts, StageCounts::uniform(3));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: SwarmSettings =
            serde_json::from_str(r#"{"stagger_ms": 50, "counts": {"code": 4}}"#).unwrap();
        assert_eq!(settings.stagger_ms, 50);
        assert_eq!(settings.counts.code, 4);
        assert_eq!(settings.counts.research, 1);
        assert_eq!(settings.max_attempts, 3);
    }
}
