//! # Ticket Storage
//!
//! Project-mode work items stored in SQLite. Each ticket is a row in the
//! `tickets` table; dependency and evidence links live in side tables.
//!
//! Retries are counted only by [`TicketStore::fail_ticket`]. The third
//! failure marks the ticket failed and opens a separate escalation ticket
//! for human follow-up.

use super::db::{parse_timestamp, HivemindDb};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::swarm::pipeline::Role;

/// Failures after which a ticket is escalated
pub const MAX_TICKET_RETRIES: u32 = 3;

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Backlog,
    InProgress,
    Done,
    Failed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "backlog" => Self::Backlog,
            "in_progress" => Self::InProgress,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Backlog,
        }
    }
}

/// A unit of project-mode work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    pub assigned_role: Role,
    pub status: TicketStatus,
    pub retry_count: u32,
    /// Ticket ids that must be done first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Linked evidence record ids
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Original ticket, for escalation tickets
    #[serde(default)]
    pub escalated_from: Option<String>,
    /// Last failure reason or escalation context
    #[serde(default)]
    pub failure_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn is_escalation(&self) -> bool {
        self.title.starts_with("[Escalation]")
    }
}

/// Input for creating a ticket
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub assigned_role: Role,
    pub dependencies: Vec<String>,
}

impl NewTicket {
    pub fn new(title: impl Into<String>, description: impl Into<String>, role: Role) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            assigned_role: role,
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ticket_id: impl Into<String>) -> Self {
        self.dependencies.push(ticket_id.into());
        self
    }
}

/// What a failure did to the ticket
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Ticket stays retryable
    Retry { retry_count: u32 },
    /// Retry budget exhausted, escalation ticket created
    Escalated { retry_count: u32, escalation: Ticket },
}

/// Ticket storage capability
pub trait TicketStore: Send + Sync {
    fn create(&self, ticket: NewTicket) -> Result<Ticket>;
    fn get(&self, id: &str) -> Result<Ticket>;
    fn set_status(&self, id: &str, status: TicketStatus) -> Result<()>;
    /// Count a failure; escalates on the third one
    fn fail_ticket(&self, id: &str, reason: &str) -> Result<FailOutcome>;
    /// Open an escalation ticket, optionally referencing an original ticket
    fn create_escalation(&self, original: Option<&str>, title: &str, context: &str)
        -> Result<Ticket>;
    /// All tickets in creation order
    fn list(&self) -> Result<Vec<Ticket>>;
}

/// SQLite-backed ticket store
pub struct TicketManager {
    conn: Arc<Mutex<Connection>>,
}

impl TicketManager {
    /// Create a new TicketManager from a HivemindDb
    pub fn new(db: &HivemindDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn insert(&self, conn: &Connection, ticket: &Ticket) -> Result<()> {
        let seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM tickets", [], |row| {
            row.get(0)
        })?;

        conn.execute(
            r#"
            INSERT INTO tickets
            (id, title, description, assigned_role, status, retry_count, escalated_from,
             failure_context, seq, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                ticket.id,
                ticket.title,
                ticket.description,
                ticket.assigned_role.as_str(),
                ticket.status.as_str(),
                ticket.retry_count,
                ticket.escalated_from,
                ticket.failure_context,
                seq,
                ticket.created_at.to_rfc3339(),
                ticket.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to create ticket")?;

        for dependency in &ticket.dependencies {
            conn.execute(
                "INSERT OR IGNORE INTO ticket_dependencies (ticket_id, depends_on) VALUES (?1, ?2)",
                params![ticket.id, dependency],
            )?;
        }

        Ok(())
    }

    fn load(conn: &Connection, id: &str) -> Result<Ticket> {
        let mut ticket = conn
            .query_row(
                r#"
                SELECT id, title, description, assigned_role, status, retry_count,
                       escalated_from, failure_context, created_at, updated_at
                FROM tickets WHERE id = ?1
                "#,
                params![id],
                Self::row_to_ticket,
            )
            .with_context(|| format!("Ticket not found: {}", id))?;

        Self::load_links(conn, &mut ticket)?;
        Ok(ticket)
    }

    fn load_links(conn: &Connection, ticket: &mut Ticket) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT depends_on FROM ticket_dependencies WHERE ticket_id = ?1 ORDER BY depends_on",
        )?;
        ticket.dependencies = stmt
            .query_map(params![ticket.id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT evidence_id FROM ticket_evidence WHERE ticket_id = ?1 ORDER BY evidence_id",
        )?;
        ticket.evidence = stmt
            .query_map(params![ticket.id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(())
    }

    fn row_to_ticket(row: &rusqlite::Row) -> rusqlite::Result<Ticket> {
        let role: String = row.get(3)?;
        let status: String = row.get(4)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(Ticket {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            assigned_role: Role::from_str(&role).unwrap_or(Role::Coder),
            status: TicketStatus::from_str(&status),
            retry_count: row.get(5)?,
            dependencies: Vec::new(),
            evidence: Vec::new(),
            escalated_from: row.get(6)?,
            failure_context: row.get(7)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }
}

impl TicketStore for TicketManager {
    fn create(&self, new_ticket: NewTicket) -> Result<Ticket> {
        let now = Utc::now();
        let ticket = Ticket {
            id: generate_ticket_id(),
            title: new_ticket.title,
            description: new_ticket.description,
            assigned_role: new_ticket.assigned_role,
            status: TicketStatus::Backlog,
            retry_count: 0,
            dependencies: new_ticket.dependencies,
            evidence: Vec::new(),
            escalated_from: None,
            failure_context: None,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock()?;
        self.insert(&conn, &ticket)?;
        Ok(ticket)
    }

    fn get(&self, id: &str) -> Result<Ticket> {
        let conn = self.lock()?;
        Self::load(&conn, id)
    }

    fn set_status(&self, id: &str, status: TicketStatus) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE tickets SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;

        if affected == 0 {
            anyhow::bail!("Ticket not found: {}", id);
        }
        Ok(())
    }

    fn fail_ticket(&self, id: &str, reason: &str) -> Result<FailOutcome> {
        let conn = self.lock()?;
        let ticket = Self::load(&conn, id)?;
        if ticket.status == TicketStatus::Failed {
            anyhow::bail!("Ticket {} already failed and was escalated", id);
        }
        let retry_count = ticket.retry_count + 1;
        let now = Utc::now().to_rfc3339();

        if retry_count < MAX_TICKET_RETRIES {
            conn.execute(
                r#"
                UPDATE tickets SET retry_count = ?1, status = 'backlog',
                    failure_context = ?2, updated_at = ?3
                WHERE id = ?4
                "#,
                params![retry_count, reason, now, id],
            )?;
            tracing::debug!(ticket_id = %id, retry_count, "Ticket failed, will retry");
            return Ok(FailOutcome::Retry { retry_count });
        }

        conn.execute(
            r#"
            UPDATE tickets SET retry_count = ?1, status = 'failed',
                failure_context = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![retry_count, reason, now, id],
        )?;

        let escalation = escalation_ticket(
            Some(id),
            &format!("[Escalation] {}", ticket.title),
            &format!(
                "Ticket {} failed {} times.\n\nLast failure:\n{}\n\nOriginal description:\n{}",
                id, retry_count, reason, ticket.description
            ),
        );
        self.insert(&conn, &escalation)?;

        tracing::warn!(ticket_id = %id, escalation_id = %escalation.id, "Ticket escalated after repeated failures");
        Ok(FailOutcome::Escalated {
            retry_count,
            escalation,
        })
    }

    fn create_escalation(
        &self,
        original: Option<&str>,
        title: &str,
        context: &str,
    ) -> Result<Ticket> {
        let title = if title.starts_with("[Escalation]") {
            title.to_string()
        } else {
            format!("[Escalation] {}", title)
        };
        let ticket = escalation_ticket(original, &title, context);

        let conn = self.lock()?;
        self.insert(&conn, &ticket)?;
        Ok(ticket)
    }

    fn list(&self) -> Result<Vec<Ticket>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, title, description, assigned_role, status, retry_count,
                   escalated_from, failure_context, created_at, updated_at
            FROM tickets
            ORDER BY seq ASC
            "#,
        )?;

        let mut tickets = stmt
            .query_map([], Self::row_to_ticket)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list tickets")?;

        for ticket in &mut tickets {
            Self::load_links(&conn, ticket)?;
        }
        Ok(tickets)
    }
}

fn escalation_ticket(original: Option<&str>, title: &str, context: &str) -> Ticket {
    let now = Utc::now();
    Ticket {
        id: generate_ticket_id(),
        title: title.to_string(),
        description: context.to_string(),
        assigned_role: Role::Planner,
        status: TicketStatus::Backlog,
        retry_count: 0,
        dependencies: Vec::new(),
        evidence: Vec::new(),
        escalated_from: original.map(String::from),
        failure_context: Some(context.to_string()),
        created_at: now,
        updated_at: now,
    }
}

fn generate_ticket_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("t-{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TicketManager {
        TicketManager::new(&HivemindDb::open_in_memory().unwrap())
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TicketStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_create_and_get_with_dependencies() {
        let store = store();
        let first = store
            .create(NewTicket::new("Schema", "Add tables", Role::Coder))
            .unwrap();
        let second = store
            .create(NewTicket::new("API", "Expose endpoints", Role::Coder).depends_on(&first.id))
            .unwrap();

        let loaded = store.get(&second.id).unwrap();
        assert_eq!(loaded.title, "API");
        assert_eq!(loaded.dependencies, vec![first.id.clone()]);
        assert_eq!(loaded.status, TicketStatus::Backlog);

        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
    }

    #[test]
    fn test_set_status_unknown_ticket() {
        assert!(store().set_status("t-missing", TicketStatus::Done).is_err());
    }

    #[test]
    fn test_third_failure_escalates_without_rewriting_original() {
        let store = store();
        let ticket = store
            .create(NewTicket::new("Flaky", "Do the thing", Role::Coder))
            .unwrap();

        assert!(matches!(
            store.fail_ticket(&ticket.id, "exit 1").unwrap(),
            FailOutcome::Retry { retry_count: 1 }
        ));
        assert!(matches!(
            store.fail_ticket(&ticket.id, "exit 1").unwrap(),
            FailOutcome::Retry { retry_count: 2 }
        ));

        let outcome = store.fail_ticket(&ticket.id, "exit 2").unwrap();
        let escalation = match outcome {
            FailOutcome::Escalated {
                retry_count,
                escalation,
            } => {
                assert_eq!(retry_count, 3);
                escalation
            }
            other => panic!("expected escalation, got {:?}", other),
        };

        assert_ne!(escalation.id, ticket.id);
        assert_eq!(escalation.escalated_from.as_deref(), Some(ticket.id.as_str()));
        assert!(escalation.is_escalation());
        assert!(escalation.description.contains("exit 2"));

        let original = store.get(&ticket.id).unwrap();
        assert_eq!(original.title, "Flaky");
        assert_eq!(original.retry_count, 3);
        assert_eq!(original.status, TicketStatus::Failed);

        let escalations: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .filter(|t| t.is_escalation())
            .collect();
        assert_eq!(escalations.len(), 1);
    }

    #[test]
    fn test_standalone_escalation() {
        let store = store();
        let ticket = store
            .create_escalation(None, "Guardrail refusal", "confidence 12%")
            .unwrap();
        assert_eq!(ticket.title, "[Escalation] Guardrail refusal");
        assert!(ticket.escalated_from.is_none());
    }

    #[test]
    fn test_failing_an_escalated_ticket_is_rejected() {
        let store = store();
        let ticket = store
            .create(NewTicket::new("Flaky", "Do the thing", Role::Coder))
            .unwrap();
        for _ in 0..MAX_TICKET_RETRIES {
            store.fail_ticket(&ticket.id, "exit 1").unwrap();
        }

        assert!(store.fail_ticket(&ticket.id, "exit 1").is_err());

        let original = store.get(&ticket.id).unwrap();
        assert_eq!(original.retry_count, MAX_TICKET_RETRIES);
        assert_eq!(original.status, TicketStatus::Failed);
        let escalations = store
            .list()
            .unwrap()
            .into_iter()
            .filter(|t| t.escalated_from.as_deref() == Some(ticket.id.as_str()))
            .count();
        assert_eq!(escalations, 1);
    }
}
