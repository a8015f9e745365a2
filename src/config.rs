use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agent::Transport;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RalphConfig {
    pub project: ProjectConfig,
    pub execution: ExecutionConfig,
    pub agent: AgentConfig,
    pub prompt: PromptConfig,
    pub notify: NotifyConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project name used in notification payloads.
    pub name: String,
    /// Backlog directory, relative to the working directory.
    pub prd_dir: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Default iteration budget for `run`.
    pub iterations: u32,
    /// Inter-iteration delay in seconds.
    pub gap_seconds: u64,
    /// Per-subprocess timeout in minutes.
    pub timeout_minutes: u32,
    /// Optional max-turn bound passed to the backend CLI (0 = unbounded).
    pub max_turns: u32,
    pub transport: TransportConfig,
}

#[derive(Default, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportConfig {
    #[default]
    Pipe,
    Pty,
}

impl From<TransportConfig> for Transport {
    fn from(t: TransportConfig) -> Self {
        match t {
            TransportConfig::Pipe => Transport::Pipe,
            TransportConfig::Pty => Transport::Pty,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub model: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PromptConfig {
    /// Root of layered context files (base.md, workflow.md, stacks/).
    pub contexts_dir: String,
    /// Root of story prompt templates (base.md, us.md, bug.md, ...).
    pub prompts_dir: String,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Topic identifier for the notification port. Empty disables
    /// notifications.
    pub topic: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "ralph".to_string(),
            prd_dir: "prd".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            gap_seconds: 5,
            timeout_minutes: 10,
            max_turns: 0,
            transport: TransportConfig::Pipe,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            contexts_dir: ".ralph/contexts".to_string(),
            prompts_dir: ".ralph/prompts".to_string(),
        }
    }
}

pub fn normalize_config(config: &mut RalphConfig) {
    let trimmed = config.agent.model.trim();
    if trimmed.is_empty() {
        config.agent.model = AgentConfig::default().model;
    } else if trimmed.len() != config.agent.model.len() {
        config.agent.model = trimmed.to_string();
    }
}

pub fn validate(config: &RalphConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.iterations < 1 {
        errors.push("execution.iterations must be >= 1".to_string());
    }

    if config.execution.timeout_minutes < 1 {
        errors.push("execution.timeout_minutes must be >= 1".to_string());
    }

    let model = &config.agent.model;
    let is_valid = !model.is_empty()
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if !is_valid {
        errors.push(
            "agent.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')"
                .to_string(),
        );
    } else if model.starts_with('-') {
        errors
            .push("agent.model must not start with '-' (flag-like values are rejected)".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{working_dir}/ralph.toml`.
///
/// When `config_path` is `Some`, the file MUST exist. When `None`, a
/// missing `ralph.toml` yields defaults.
pub fn load_config_from(
    config_path: Option<&Path>,
    working_dir: &Path,
) -> Result<RalphConfig, String> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            load_config_at(path)
        }
        None => load_config(working_dir),
    }
}

pub fn load_config(working_dir: &Path) -> Result<RalphConfig, String> {
    let config_path = working_dir.join("ralph.toml");
    if !config_path.exists() {
        return Ok(RalphConfig::default());
    }
    load_config_at(&config_path)
}

fn load_config_at(path: &Path) -> Result<RalphConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: RalphConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    normalize_config(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

impl RalphConfig {
    pub fn prd_dir(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.project.prd_dir)
    }

    pub fn contexts_dir(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.prompt.contexts_dir)
    }

    pub fn prompts_dir(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.prompt.prompts_dir)
    }

    pub fn max_turns(&self) -> Option<u32> {
        if self.execution.max_turns == 0 {
            None
        } else {
            Some(self.execution.max_turns)
        }
    }
}
