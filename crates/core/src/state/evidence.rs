//! # Evidence Ledger
//!
//! Append-only record of what a project-mode run actually did: CLI output
//! excerpts from workers and diff summaries of the working tree. Tickets
//! link to the evidence record of the run that executed them.

use super::db::{parse_timestamp, HivemindDb};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Longest CLI excerpt stored per entry, in characters
pub const MAX_EXCERPT_CHARS: usize = 4000;

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    CliExcerpt,
    DiffSummary,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CliExcerpt => "cli_excerpt",
            Self::DiffSummary => "diff_summary",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "diff_summary" => Self::DiffSummary,
            _ => Self::CliExcerpt,
        }
    }
}

/// One ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub kind: EvidenceKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Evidence ledger capability
pub trait EvidenceLedger: Send + Sync {
    /// Open a new evidence record for a pipeline run
    fn create_pipeline_evidence(&self, project_path: &str) -> Result<String>;
    fn append_cli_excerpt(&self, evidence_id: &str, source: &str, output: &str) -> Result<()>;
    fn append_diff_summary(&self, evidence_id: &str, summary: &str) -> Result<()>;
    fn link_ticket_to_evidence(&self, ticket_id: &str, evidence_id: &str) -> Result<()>;
    fn entries(&self, evidence_id: &str) -> Result<Vec<EvidenceEntry>>;
}

/// SQLite-backed evidence ledger
pub struct EvidenceManager {
    conn: Arc<Mutex<Connection>>,
}

impl EvidenceManager {
    pub fn new(db: &HivemindDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    fn append(&self, evidence_id: &str, kind: EvidenceKind, content: &str) -> Result<()> {
        let conn = self.lock()?;

        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM evidence WHERE id = ?1",
            params![evidence_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            anyhow::bail!("Evidence record not found: {}", evidence_id);
        }

        conn.execute(
            "INSERT INTO evidence_entries (evidence_id, kind, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![evidence_id, kind.as_str(), content, Utc::now().to_rfc3339()],
        )
        .context("Failed to append evidence")?;
        Ok(())
    }
}

impl EvidenceLedger for EvidenceManager {
    fn create_pipeline_evidence(&self, project_path: &str) -> Result<String> {
        let id = format!("ev-{}", uuid::Uuid::new_v4().simple());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO evidence (id, project_path, created_at) VALUES (?1, ?2, ?3)",
            params![id, project_path, Utc::now().to_rfc3339()],
        )
        .context("Failed to create evidence record")?;
        Ok(id)
    }

    fn append_cli_excerpt(&self, evidence_id: &str, source: &str, output: &str) -> Result<()> {
        let content = format!("[{}]\n{}", source, truncate_chars(output, MAX_EXCERPT_CHARS));
        self.append(evidence_id, EvidenceKind::CliExcerpt, &content)
    }

    fn append_diff_summary(&self, evidence_id: &str, summary: &str) -> Result<()> {
        self.append(evidence_id, EvidenceKind::DiffSummary, summary)
    }

    fn link_ticket_to_evidence(&self, ticket_id: &str, evidence_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO ticket_evidence (ticket_id, evidence_id) VALUES (?1, ?2)",
            params![ticket_id, evidence_id],
        )?;
        Ok(())
    }

    fn entries(&self, evidence_id: &str) -> Result<Vec<EvidenceEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT kind, content, created_at FROM evidence_entries WHERE evidence_id = ?1 ORDER BY id ASC",
        )?;

        let entries = stmt
            .query_map(params![evidence_id], |row| {
                let kind: String = row.get(0)?;
                let created_at: String = row.get(2)?;
                Ok(EvidenceEntry {
                    kind: EvidenceKind::from_str(&kind),
                    content: row.get(1)?,
                    created_at: parse_timestamp(&created_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// Truncate to at most `max` characters, marking the cut
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
