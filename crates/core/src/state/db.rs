//! # Unified Hivemind Database
//!
//! Single SQLite database for all Hivemind state persistence:
//! output cache, tickets, evidence ledger, settings, prompt templates
//! and run history live in `.hivemind/hivemind.db`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::io::get_runtime_path;
use crate::swarm::prompts;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Unified database manager for all Hivemind state
pub struct HivemindDb {
    conn: Arc<Mutex<Connection>>,
}

/// A finished pipeline run, as recorded in `pipeline_runs`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub prompt: String,
    pub mode: String,
    pub outcome: String,
    pub confidence: u8,
    pub validation_passed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl HivemindDb {
    /// Open or create the unified database at `.hivemind/hivemind.db`
    pub fn open() -> Result<Self> {
        Self::open_at(get_runtime_path().join("hivemind.db"))
    }

    /// Open database at a specific path (useful for testing)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open hivemind database")?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            self.migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - complete schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS output_cache (
                prompt_hash TEXT NOT NULL,
                provider TEXT NOT NULL,
                output TEXT NOT NULL,
                confidence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (prompt_hash, provider)
            );

            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                assigned_role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'backlog',
                retry_count INTEGER NOT NULL DEFAULT 0,
                escalated_from TEXT,
                failure_context TEXT,
                seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ticket_dependencies (
                ticket_id TEXT NOT NULL,
                depends_on TEXT NOT NULL,
                PRIMARY KEY (ticket_id, depends_on)
            );

            CREATE TABLE IF NOT EXISTS evidence (
                id TEXT PRIMARY KEY,
                project_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evidence_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                evidence_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ticket_evidence (
                ticket_id TEXT NOT NULL,
                evidence_id TEXT NOT NULL,
                PRIMARY KEY (ticket_id, evidence_id)
            );

            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                mode TEXT NOT NULL,
                outcome TEXT NOT NULL,
                confidence INTEGER NOT NULL,
                validation_passed INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS prompt_templates (
                slug TEXT PRIMARY KEY,
                version INTEGER NOT NULL DEFAULT 1,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
            CREATE INDEX IF NOT EXISTS idx_tickets_seq ON tickets(seq);
            CREATE INDEX IF NOT EXISTS idx_evidence_entries_evidence ON evidence_entries(evidence_id);
            CREATE INDEX IF NOT EXISTS idx_runs_finished ON pipeline_runs(finished_at);
            "#,
        )
        .context("Failed to apply schema v1")?;

        tracing::info!(
            "HivemindDb initialized with schema version {}",
            SCHEMA_VERSION
        );

        Ok(())
    }

    // =========================================================================
    // Prompt Template Methods
    // =========================================================================

    /// Seed default prompts if the table is empty
    pub fn seed_prompts(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM prompt_templates", [], |row| {
            row.get(0)
        })?;

        if count > 0 {
            tracing::debug!("Prompts already seeded ({} found)", count);
            return Ok(0);
        }

        let mut inserted = 0;
        for (slug, content) in prompts::all_defaults() {
            conn.execute(
                "INSERT INTO prompt_templates (slug, version, content) VALUES (?1, 1, ?2)",
                params![slug, content],
            )?;
            inserted += 1;
        }

        tracing::info!("Seeded {} default prompts", inserted);
        Ok(inserted)
    }

    /// Get a prompt by slug
    pub fn get_prompt(&self, slug: &str) -> Result<String> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            "SELECT content FROM prompt_templates WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )
        .with_context(|| format!("Prompt '{}' not found", slug))
    }

    /// Update a prompt (increments version automatically)
    pub fn set_prompt(&self, slug: &str, content: &str) -> Result<i32> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let current_version: i32 = conn
            .query_row(
                "SELECT version FROM prompt_templates WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let new_version = current_version + 1;

        conn.execute(
            r#"
            INSERT INTO prompt_templates (slug, version, content, updated_at)
            VALUES (?1, ?2, ?3, datetime('now'))
            ON CONFLICT(slug) DO UPDATE SET
                version = ?2,
                content = ?3,
                updated_at = datetime('now')
            "#,
            params![slug, new_version, content],
        )?;

        tracing::debug!("Updated prompt '{}' to version {}", slug, new_version);
        Ok(new_version)
    }

    // =========================================================================
    // Run History Methods
    // =========================================================================

    /// Record a finished pipeline run
    pub fn record_run(&self, record: &RunRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO pipeline_runs
            (id, prompt, mode, outcome, confidence, validation_passed, started_at, finished_at, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                record.prompt,
                record.mode,
                record.outcome,
                record.confidence,
                record.validation_passed,
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
                record.duration_ms as i64,
            ],
        )
        .context("Failed to record pipeline run")?;

        Ok(())
    }

    /// Most recently finished run, if any
    pub fn last_run(&self) -> Result<Option<RunRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let record = conn
            .query_row(
                r#"
                SELECT id, prompt, mode, outcome, confidence, validation_passed,
                       started_at, finished_at, duration_ms
                FROM pipeline_runs
                ORDER BY finished_at DESC
                LIMIT 1
                "#,
                [],
                |row| {
                    let started_at: String = row.get(6)?;
                    let finished_at: String = row.get(7)?;
                    let duration_ms: i64 = row.get(8)?;
                    Ok(RunRecord {
                        id: row.get(0)?,
                        prompt: row.get(1)?,
                        mode: row.get(2)?,
                        outcome: row.get(3)?,
                        confidence: row.get(4)?,
                        validation_passed: row.get(5)?,
                        started_at: parse_timestamp(&started_at),
                        finished_at: parse_timestamp(&finished_at),
                        duration_ms: duration_ms.max(0) as u64,
                    })
                },
            )
            .optional()
            .context("Failed to load last pipeline run")?;

        Ok(record)
    }
}

/// Parse an RFC 3339 timestamp, falling back to now
pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = HivemindDb::open_in_memory().unwrap();
        let conn = db.connection();
        let conn = conn.lock().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "settings",
            "output_cache",
            "tickets",
            "ticket_dependencies",
            "evidence",
            "evidence_entries",
            "ticket_evidence",
            "pipeline_runs",
            "prompt_templates",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_schema_version_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hivemind.db");

        // Open twice - should not fail on second open
        drop(HivemindDb::open_at(&path).unwrap());
        let db = HivemindDb::open_at(&path).unwrap();

        let conn = db.connection();
        let conn = conn.lock().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();

        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_prompt_seeding_and_update() {
        let db = HivemindDb::open_in_memory().unwrap();

        let count = db.seed_prompts().unwrap();
        assert_eq!(count, prompts::all_defaults().len());
        assert_eq!(db.seed_prompts().unwrap(), 0, "Should not re-seed");

        let content = db.get_prompt("research").unwrap();
        assert!(content.contains("{prompt}"));

        let version = db.set_prompt("research", "Research: {prompt}").unwrap();
        assert_eq!(version, 2);
        assert_eq!(db.get_prompt("research").unwrap(), "Research: {prompt}");
    }

    #[test]
    fn test_run_history() {
        let db = HivemindDb::open_in_memory().unwrap();
        assert!(db.last_run().unwrap().is_none());

        let now = Utc::now();
        let older = RunRecord {
            id: "run-1".into(),
            prompt: "first".into(),
            mode: "chat".into(),
            outcome: "completed".into(),
            confidence: 50,
            validation_passed: true,
            started_at: now - chrono::Duration::seconds(20),
            finished_at: now - chrono::Duration::seconds(10),
            duration_ms: 10_000,
        };
        let newer = RunRecord {
            id: "run-2".into(),
            prompt: "second".into(),
            finished_at: now,
            ..older.clone()
        };
        db.record_run(&older).unwrap();
        db.record_run(&newer).unwrap();

        let last = db.last_run().unwrap().unwrap();
        assert_eq!(last.id, "run-2");
        assert_eq!(last.duration_ms, 10_000);
        assert!(last.validation_passed);
    }
}
