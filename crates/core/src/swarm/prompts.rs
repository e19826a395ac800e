//! Default prompt templates bundled at compile time.
//!
//! These are used for seeding the database on first run.
//! At runtime, prompts are loaded from the database to allow customization.

use std::collections::HashMap;

use crate::state::db::HivemindDb;
use crate::state::tickets::Ticket;

/// Researcher - gathers cited facts about the task
pub const RESEARCH: &str = include_str!("defaults/research.md");

/// Planner - numbered implementation plan
pub const PLAN: &str = include_str!("defaults/plan.md");

/// Coder - implements a share of the plan
pub const CODE: &str = include_str!("defaults/code.md");

/// Validator - reviews coder output
pub const VALIDATE: &str = include_str!("defaults/validate.md");

/// Security reviewer - audits the changes
pub const SECURITY: &str = include_str!("defaults/security.md");

/// Synthesizer - final answer
pub const SYNTHESIZE: &str = include_str!("defaults/synthesize.md");

/// Project-mode coder working one ticket
pub const TICKET: &str = include_str!("defaults/ticket.md");

/// All default prompts with their slugs for seeding
pub fn all_defaults() -> Vec<(&'static str, &'static str)> {
    vec![
        ("research", RESEARCH),
        ("plan", PLAN),
        ("code", CODE),
        ("validate", VALIDATE),
        ("security", SECURITY),
        ("synthesize", SYNTHESIZE),
        ("ticket", TICKET),
    ]
}

/// Substitute `{name}` placeholders in one pass. Unknown placeholders and
/// braces inside substituted values are left alone.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });

        match replacement {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Templates by slug, database overrides first, bundled defaults otherwise
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<String, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::bundled()
    }
}

impl PromptLibrary {
    pub fn bundled() -> Self {
        Self {
            templates: all_defaults()
                .into_iter()
                .map(|(slug, content)| (slug.to_string(), content.to_string()))
                .collect(),
        }
    }

    /// Load customised templates from the database
    pub fn from_db(db: &HivemindDb) -> Self {
        let mut library = Self::bundled();
        for (slug, _) in all_defaults() {
            match db.get_prompt(slug) {
                Ok(content) => {
                    library.templates.insert(slug.to_string(), content);
                }
                Err(e) => {
                    tracing::debug!(slug = %slug, "Using bundled prompt: {}", e);
                }
            }
        }
        library
    }

    fn template(&self, slug: &str) -> &str {
        self.templates.get(slug).map(String::as_str).unwrap_or("{prompt}\n\n{context}")
    }

    pub fn research_prompt(&self, prompt: &str) -> String {
        render(self.template("research"), &[("prompt", prompt)])
    }

    pub fn plan_prompt(&self, prompt: &str, research: &str) -> String {
        render(
            self.template("plan"),
            &[("prompt", prompt), ("context", or_none(research))],
        )
    }

    /// One prompt per coder, each naming its share of the plan
    pub fn code_prompts(&self, prompt: &str, plan: &str, count: usize) -> Vec<String> {
        let parts = count.max(1).to_string();
        (0..count.max(1))
            .map(|i| {
                let part = (i + 1).to_string();
                render(
                    self.template("code"),
                    &[
                        ("prompt", prompt),
                        ("context", or_none(plan)),
                        ("part", &part),
                        ("parts", &parts),
                    ],
                )
            })
            .collect()
    }

    pub fn validate_prompt(&self, prompt: &str, code_output: &str) -> String {
        render(
            self.template("validate"),
            &[("prompt", prompt), ("context", or_none(code_output))],
        )
    }

    pub fn security_prompt(&self, prompt: &str, code_output: &str, findings: &str) -> String {
        let context = if findings.trim().is_empty() {
            code_output.to_string()
        } else {
            format!("{}\n\n### Automated checks\n\n{}", code_output, findings)
        };
        render(
            self.template("security"),
            &[("prompt", prompt), ("context", or_none(&context))],
        )
    }

    pub fn synthesize_prompt(&self, prompt: &str, stage_outputs: &str, confidence: u8) -> String {
        let confidence = confidence.to_string();
        render(
            self.template("synthesize"),
            &[
                ("prompt", prompt),
                ("context", or_none(stage_outputs)),
                ("confidence", &confidence),
            ],
        )
    }

    pub fn ticket_prompt(&self, goal: &str, ticket: &Ticket, index: usize, total: usize) -> String {
        let context = format!("### {}\n\n{}", ticket.title, ticket.description);
        let part = (index + 1).to_string();
        let parts = total.to_string();
        render(
            self.template("ticket"),
            &[
                ("prompt", goal),
                ("context", &context),
                ("part", &part),
                ("parts", &parts),
            ],
        )
    }
}

fn or_none(text: &str) -> &str {
    if text.trim().is_empty() {
        "(none)"
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_prompts_non_empty() {
        for (slug, content) in all_defaults() {
            assert!(content.len() > 50, "Prompt '{}' seems too short", slug);
            assert!(content.contains("{prompt}"), "Prompt '{}' lacks {{prompt}}", slug);
        }
    }

    #[test]
    fn test_render_single_pass() {
        let out = render(
            "{prompt} / {context} / {missing}",
            &[("prompt", "use {context} literally"), ("context", "ctx")],
        );
        assert_eq!(out, "use {context} literally / ctx / {missing}");
        assert_eq!(render("no braces", &[]), "no braces");
        assert_eq!(render("dangling {", &[("prompt", "x")]), "dangling {");
    }

    #[test]
    fn test_code_prompts_split() {
        let library = PromptLibrary::bundled();
        let prompts = library.code_prompts("Refactor auth", "1. a\n2. b", 3);
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("coder 1 of 3"));
        assert!(prompts[2].contains("coder 3 of 3"));
        assert!(prompts.iter().all(|p| p.contains("Refactor auth")));
    }

    #[test]
    fn test_synthesize_includes_confidence() {
        let prompt = PromptLibrary::bundled().synthesize_prompt("task", "outputs", 64);
        assert!(prompt.contains("64%"));
        assert!(prompt.contains("outputs"));
    }

    #[test]
    fn test_db_override() {
        let db = HivemindDb::open_in_memory().unwrap();
        db.seed_prompts().unwrap();
        db.set_prompt("research", "Look into: {prompt}").unwrap();

        let library = PromptLibrary::from_db(&db);
        assert_eq!(library.research_prompt("tokio"), "Look into: tokio");
    }
}
