//! # Static Security Checks
//!
//! Pattern-based scan run by the SECURITY stage next to the LLM reviewer.
//! Each rule becomes one check in the report; a check fails when any
//! non-exempt file matches its pattern.

use anyhow::{Context, Result};
use async_trait::async_trait;
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Files larger than this are skipped
const MAX_SCAN_BYTES: u64 = 1024 * 1024;

/// Findings listed per check before truncating
const MAX_FINDINGS_PER_CHECK: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityCheck {
    pub name: String,
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityReport {
    pub passed: bool,
    pub checks: Vec<SecurityCheck>,
}

impl SecurityReport {
    pub fn from_checks(checks: Vec<SecurityCheck>) -> Self {
        Self {
            passed: checks.iter().all(|c| c.passed),
            checks,
        }
    }

    /// Markdown summary for prompts and system messages
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            let status = if check.passed { "pass" } else { "FAIL" };
            out.push_str(&format!("- {} [{}]", check.name, status));
            if !check.passed {
                out.push_str(&format!("\n{}", indent(&check.output)));
            }
            out.push('\n');
        }
        out
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|l| format!("    {}", l))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
pub trait SecurityChecker: Send + Sync {
    async fn run_security_checks(&self, project_path: &Path) -> Result<SecurityReport>;
}

/// Configuration for the pattern scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// File patterns exempt from checks (glob syntax)
    pub exemptions: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            exemptions: vec![
                "**/tests/**".into(),
                "**/test/**".into(),
                "**/*_test.*".into(),
                "**/*.test.*".into(),
                "**/fixtures/**".into(),
                "**/*.md".into(),
                "**/*.lock".into(),
            ],
        }
    }
}

impl SecurityConfig {
    /// Check if a file path is exempt from checks
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exemptions
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|p| p.matches(path))
    }
}

struct Rule {
    name: &'static str,
    message: &'static str,
    pattern: Regex,
}

const RULES: &[(&str, &str, &str)] = &[
    (
        "hardcoded-secret",
        "possible hardcoded credential",
        r#"(?i)\b(password|passwd|secret|api[_-]?key|access[_-]?token)\b\s*[:=]\s*["'][^"'\s]{8,}["']"#,
    ),
    (
        "private-key",
        "private key material",
        r"-----BEGIN (RSA |EC |OPENSSH |DSA )?PRIVATE KEY-----",
    ),
    (
        "aws-access-key",
        "AWS access key id",
        r"\bAKIA[0-9A-Z]{16}\b",
    ),
    (
        "dynamic-eval",
        "dynamic code evaluation",
        r"\b(eval|exec)\s*\(",
    ),
    (
        "shell-injection",
        "shell invocation with interpolated input",
        r#"(shell\s*=\s*True|os\.system\s*\(|child_process\.exec\s*\(|Command::new\("(sh|bash)"\))"#,
    ),
];

/// Regex rules over every text file of the project
pub struct PatternSecurityChecker {
    config: SecurityConfig,
}

impl Default for PatternSecurityChecker {
    fn default() -> Self {
        Self::new(SecurityConfig::default())
    }
}

impl PatternSecurityChecker {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    fn rules() -> Result<Vec<Rule>> {
        RULES
            .iter()
            .map(|(name, message, pattern)| {
                Ok(Rule {
                    name,
                    message,
                    pattern: Regex::new(pattern)
                        .with_context(|| format!("Invalid security rule {}", name))?,
                })
            })
            .collect()
    }

    /// Scan synchronously; run inside `spawn_blocking`
    pub fn scan(root: &Path, config: &SecurityConfig) -> Result<SecurityReport> {
        if !root.exists() {
            anyhow::bail!("Project path does not exist: {:?}", root);
        }

        let rules = Self::rules()?;
        let mut findings: Vec<Vec<String>> = vec![Vec::new(); rules.len()];

        let walker = ignore::WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != ".git" && name != ".hivemind" && name != "node_modules" && name != "target"
            })
            .build();

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let relative = relative_display(root, path);
            if config.is_exempt(&relative) || config.is_exempt(&path.to_string_lossy()) {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_SCAN_BYTES).unwrap_or(true) {
                continue;
            }
            // Binary or non-UTF-8 files are skipped
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };

            for (line_no, line) in content.lines().enumerate() {
                for (i, rule) in rules.iter().enumerate() {
                    if rule.pattern.is_match(line) {
                        findings[i].push(format!("{}:{}: {}", relative, line_no + 1, rule.message));
                    }
                }
            }
        }

        let checks = rules
            .iter()
            .zip(findings)
            .map(|(rule, found)| {
                let passed = found.is_empty();
                let mut output = found
                    .iter()
                    .take(MAX_FINDINGS_PER_CHECK)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                if found.len() > MAX_FINDINGS_PER_CHECK {
                    output.push_str(&format!(
                        "\n... and {} more",
                        found.len() - MAX_FINDINGS_PER_CHECK
                    ));
                }
                SecurityCheck {
                    name: rule.name.to_string(),
                    passed,
                    output,
                }
            })
            .collect();

        Ok(SecurityReport::from_checks(checks))
    }
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}

#[async_trait]
impl SecurityChecker for PatternSecurityChecker {
    async fn run_security_checks(&self, project_path: &Path) -> Result<SecurityReport> {
        let root = project_path.to_path_buf();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || Self::scan(&root, &config))
            .await
            .context("Security scan task failed")?
    }
}
