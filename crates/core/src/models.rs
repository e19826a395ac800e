//! # Worker Providers
//!
//! Centralized configuration for the external agent CLIs the swarm can run.
//! A provider is a command line that, given a prompt and a working
//! directory, streams text to stdout and exits with a status code.
//!
//! Resolution never mutates the configured list: it returns a
//! [`ResolvedProviders`] map from provider id to the launch command that
//! will actually be executed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Placeholder substituted with the prompt inside provider arguments.
/// When no argument contains it, the prompt is written to stdin instead.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// A configured worker provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Stable provider id ("claude", "codex", ...)
    pub id: String,
    /// Executable name or path
    pub command: String,
    /// Arguments, may contain `{prompt}`
    #[serde(default)]
    pub args: Vec<String>,
    /// Disabled providers are skipped during resolution
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            enabled: true,
        }
    }

    /// Built-in providers, in round-robin order
    pub fn defaults() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig::new("claude", "claude", &["-p", PROMPT_PLACEHOLDER]),
            ProviderConfig::new("codex", "codex", &["exec", PROMPT_PLACEHOLDER]),
            ProviderConfig::new("gemini", "gemini", &["-p", PROMPT_PLACEHOLDER]),
            ProviderConfig::new("cursor", "cursor-agent", &["-p", PROMPT_PLACEHOLDER]),
        ]
    }
}

/// The concrete command line used to launch a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Whether the prompt is passed as an argument (otherwise via stdin)
    pub fn takes_prompt_arg(&self) -> bool {
        self.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER))
    }

    /// Arguments with the prompt substituted in
    pub fn render_args(&self, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(PROMPT_PLACEHOLDER, prompt))
            .collect()
    }
}

/// One provider that resolved to a runnable command
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub id: String,
    pub launch: LaunchCommand,
}

/// Ordered provider id -> launch command map
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedProviders {
    providers: Vec<ResolvedProvider>,
}

impl ResolvedProviders {
    pub fn new(providers: Vec<ResolvedProvider>) -> Self {
        Self { providers }
    }

    /// Providers known only by id (launch commands are never consulted,
    /// e.g. when a custom spawner is injected)
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            providers: ids
                .into_iter()
                .map(|id| {
                    let id = id.into();
                    ResolvedProvider {
                        launch: LaunchCommand::new(&id, Vec::new()),
                        id,
                    }
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&LaunchCommand> {
        self.providers
            .iter()
            .find(|p| p.id == id)
            .map(|p| &p.launch)
    }

    /// Round-robin pick for the agent at `index`
    pub fn pick(&self, index: usize) -> Option<&ResolvedProvider> {
        if self.providers.is_empty() {
            return None;
        }
        self.providers.get(index % self.providers.len())
    }
}

/// Id used for the configured fallback command
pub const FALLBACK_PROVIDER_ID: &str = "fallback";

/// Resolve enabled providers whose executable can be found.
///
/// When nothing resolves and a fallback command is configured, the result
/// holds only the fallback under [`FALLBACK_PROVIDER_ID`].
pub fn resolve_providers(
    configs: &[ProviderConfig],
    fallback: Option<&LaunchCommand>,
) -> ResolvedProviders {
    let mut resolved = Vec::new();

    for config in configs.iter().filter(|c| c.enabled) {
        match which::which(&config.command) {
            Ok(program) => {
                tracing::debug!(provider = %config.id, program = %program.display(), "Resolved worker provider");
                resolved.push(ResolvedProvider {
                    id: config.id.clone(),
                    launch: LaunchCommand::new(program, config.args.clone()),
                });
            }
            Err(_) => {
                tracing::debug!(provider = %config.id, command = %config.command, "Worker provider not installed");
            }
        }
    }

    if resolved.is_empty() {
        if let Some(fallback) = fallback {
            tracing::warn!(
                program = %fallback.program.display(),
                "No worker providers installed, using fallback command"
            );
            resolved.push(ResolvedProvider {
                id: FALLBACK_PROVIDER_ID.to_string(),
                launch: fallback.clone(),
            });
        }
    }

    ResolvedProviders::new(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_providers() {
        let providers = ProviderConfig::defaults();
        assert!(providers.iter().all(|p| p.enabled));
        assert!(providers.iter().any(|p| p.id == "claude"));
    }

    #[test]
    fn test_render_args() {
        let launch = LaunchCommand::new("claude", vec!["-p".into(), PROMPT_PLACEHOLDER.into()]);
        assert!(launch.takes_prompt_arg());
        assert_eq!(launch.render_args("hi"), vec!["-p", "hi"]);

        let stdin_launch = LaunchCommand::new("cat", vec![]);
        assert!(!stdin_launch.takes_prompt_arg());
    }

    #[test]
    fn test_round_robin_pick() {
        let providers = ResolvedProviders::from_ids(["a", "b"]);
        assert_eq!(providers.pick(0).map(|p| p.id.as_str()), Some("a"));
        assert_eq!(providers.pick(1).map(|p| p.id.as_str()), Some("b"));
        assert_eq!(providers.pick(2).map(|p| p.id.as_str()), Some("a"));
        assert!(ResolvedProviders::default().pick(0).is_none());
    }

    #[test]
    fn test_resolution_skips_missing_and_uses_fallback() {
        let configs = vec![ProviderConfig::new(
            "ghost",
            "definitely-not-a-real-binary-hivemind",
            &[],
        )];
        let fallback = LaunchCommand::new("/bin/echo", vec![PROMPT_PLACEHOLDER.into()]);

        let resolved = resolve_providers(&configs, Some(&fallback));
        assert_eq!(resolved.ids(), vec![FALLBACK_PROVIDER_ID.to_string()]);
        assert_eq!(resolved.get(FALLBACK_PROVIDER_ID), Some(&fallback));

        // The configuration itself is left untouched
        assert_eq!(configs[0].command, "definitely-not-a-real-binary-hivemind");

        assert!(resolve_providers(&configs, None).is_empty());
    }

    #[test]
    fn test_disabled_providers_skipped() {
        let mut config = ProviderConfig::new("sh", "sh", &[]);
        config.enabled = false;
        assert!(resolve_providers(&[config], None).is_empty());
    }
}
