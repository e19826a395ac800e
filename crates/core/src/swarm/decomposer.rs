//! # Ticket Decomposer
//!
//! Project mode turns the PLAN output into a chain of tickets and walks them
//! one at a time.

use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use super::pipeline::Role;
use crate::state::tickets::{FailOutcome, NewTicket, Ticket, TicketStatus, TicketStore};

const MAX_TITLE_CHARS: usize = 80;

/// Ticket content before it is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketDraft {
    pub title: String,
    pub description: String,
}

fn numbered_item() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*\d+[.)]\s+(.+)$").ok())
        .as_ref()
}

fn bullet_item() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*[-*•]\s+(.+)$").ok())
        .as_ref()
}

/// Split a plan into ticket drafts.
///
/// Numbered items win over bullets when both are present; indented lines
/// under an item extend its description. Without any items the whole prompt
/// becomes a single ticket.
pub fn decompose_task(prompt: &str, plan: &str, max_tickets: usize) -> Vec<TicketDraft> {
    let max_tickets = max_tickets.max(1);

    let has_numbered = numbered_item().is_some_and(|re| plan.lines().any(|l| re.is_match(l)));
    let item = if has_numbered { numbered_item() } else { bullet_item() };

    let mut drafts: Vec<TicketDraft> = Vec::new();
    if let Some(item) = item {
        let mut in_item = false;
        for line in plan.lines() {
            if let Some(caps) = item.captures(line) {
                let text = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                if text.is_empty() {
                    in_item = false;
                    continue;
                }
                drafts.push(TicketDraft {
                    title: clean_title(text),
                    description: text.to_string(),
                });
                in_item = true;
            } else if in_item && line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
                if let Some(draft) = drafts.last_mut() {
                    draft.description.push('\n');
                    draft.description.push_str(line.trim());
                }
            } else if !line.trim().is_empty() {
                in_item = false;
            }
        }
    }

    if drafts.is_empty() {
        return vec![TicketDraft {
            title: clean_title(prompt.lines().next().unwrap_or(prompt)),
            description: prompt.trim().to_string(),
        }];
    }

    drafts.truncate(max_tickets);
    drafts
}

fn clean_title(text: &str) -> String {
    let text = text.replace("**", "").replace('`', "");
    let text = text.trim().trim_end_matches(':').trim();
    let mut chars = text.chars();
    let title: String = chars.by_ref().take(MAX_TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", title.trim_end())
    } else {
        title
    }
}

/// Dependency order, stable by input order. Dependencies outside the set are
/// ignored; a cycle is an error.
pub fn order_tickets(tickets: Vec<Ticket>) -> Result<Vec<Ticket>> {
    let ids: HashSet<String> = tickets.iter().map(|t| t.id.clone()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut remaining = tickets;
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|t| {
            t.dependencies
                .iter()
                .all(|d| placed.contains(d) || !ids.contains(d))
        });

        match ready {
            Some(index) => {
                let ticket = remaining.remove(index);
                placed.insert(ticket.id.clone());
                ordered.push(ticket);
            }
            None => {
                let stuck: Vec<&str> = remaining.iter().map(|t| t.id.as_str()).collect();
                anyhow::bail!("Ticket dependency cycle among: {}", stuck.join(", "));
            }
        }
    }

    Ok(ordered)
}

/// Stores decomposed tickets and drives their lifecycle
#[derive(Clone)]
pub struct TicketDecomposer {
    store: Arc<dyn TicketStore>,
}

impl TicketDecomposer {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    /// Persist the plan as a chain of CODE tickets, each depending on the previous
    pub fn decompose(&self, prompt: &str, plan: &str, max_tickets: usize) -> Result<Vec<Ticket>> {
        let mut tickets: Vec<Ticket> = Vec::new();
        for draft in decompose_task(prompt, plan, max_tickets) {
            let mut new_ticket = NewTicket::new(draft.title, draft.description, Role::Coder);
            if let Some(previous) = tickets.last() {
                new_ticket = new_ticket.depends_on(&previous.id);
            }
            tickets.push(self.store.create(new_ticket)?);
        }

        tracing::info!(count = tickets.len(), "Decomposed task into tickets");
        order_tickets(tickets)
    }

    pub fn start_ticket(&self, id: &str) -> Result<()> {
        self.store.set_status(id, TicketStatus::InProgress)
    }

    pub fn complete_ticket(&self, id: &str) -> Result<()> {
        self.store.set_status(id, TicketStatus::Done)
    }

    pub fn fail_ticket(&self, id: &str, reason: &str) -> Result<FailOutcome> {
        self.store.fail_ticket(id, reason)
    }
}
