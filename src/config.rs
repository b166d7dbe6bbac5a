//! Configuration for runbook.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RUNBOOK_HOME, RUNBOOK_DATABASE, RUNBOOK_DRY_RUN,
//!    RUNBOOK_AGENT_ENDPOINT, RUNBOOK_AGENT_TOKEN)
//! 2. Config file (.runbook/config.yaml)
//! 3. Defaults (~/.runbook)
//!
//! Config file discovery:
//! - Searches current directory and parents for .runbook/config.yaml
//! - Paths in the config file are relative to its .runbook/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::invoker::RetryPolicy;
use crate::core::pipeline::ComplianceAgents;
use crate::domain::TopologyKind;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .runbook/)
    pub home: Option<String>,
    /// SQLite database file (relative to .runbook/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsConfig {
    pub heartbeat_seconds: Option<u64>,
    pub redact_sensitive: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsConfig {
    pub endpoint: Option<String>,
    pub dry_run: Option<bool>,
    pub stub_latency_ms: Option<u64>,
    pub sanctions: Option<String>,
    pub liquidity: Option<String>,
    pub procedures: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    pub default_topology: Option<String>,
    pub checkpointing: Option<bool>,
    pub evidence_window: Option<usize>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub events: EventSettings,
    pub agents: AgentSettings,
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSettings {
    pub heartbeat: Duration,
    pub redact_sensitive: bool,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            redact_sensitive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    /// Use the offline stub backend. Always true without an endpoint.
    pub dry_run: bool,
    pub stub_latency: Duration,
    pub compliance: ComplianceAgents,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            dry_run: true,
            stub_latency: Duration::from_millis(1500),
            compliance: ComplianceAgents::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub default_topology: TopologyKind,
    pub checkpointing: bool,
    pub evidence_window: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_topology: TopologyKind::Handoff,
            checkpointing: true,
            evidence_window: 10,
        }
    }
}

impl ResolvedConfig {
    /// Directory of per-run checkpoint logs
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.home.join("checkpoints")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".runbook").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Merge a parsed config file, environment and defaults
fn resolve(
    default_home: PathBuf,
    file: Option<(&Path, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path.to_path_buf()), config),
        None => (None, ConfigFile::default()),
    };
    // Relative paths resolve against .runbook/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = if let Some(env_home) = env("RUNBOOK_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = config.paths.home {
        resolve_path(&base_dir, home_path)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env("RUNBOOK_DATABASE") {
        PathBuf::from(env_db)
    } else if let Some(ref db_path) = config.paths.database {
        resolve_path(&base_dir, db_path)
    } else {
        home.join("runbook.db")
    };

    let events = EventSettings {
        heartbeat: Duration::from_secs(config.events.heartbeat_seconds.unwrap_or(15).max(1)),
        redact_sensitive: config.events.redact_sensitive.unwrap_or(true),
    };

    let endpoint = env("RUNBOOK_AGENT_ENDPOINT")
        .or(config.agents.endpoint)
        .filter(|e| !e.trim().is_empty());
    let requested_dry_run = match env("RUNBOOK_DRY_RUN") {
        Some(value) => parse_bool(&value)
            .with_context(|| format!("Invalid RUNBOOK_DRY_RUN value: {}", value))?,
        None => config.agents.dry_run.unwrap_or(false),
    };
    let defaults = ComplianceAgents::default();
    let agents = AgentSettings {
        dry_run: requested_dry_run || endpoint.is_none(),
        endpoint,
        token: env("RUNBOOK_AGENT_TOKEN"),
        stub_latency: Duration::from_millis(config.agents.stub_latency_ms.unwrap_or(1500)),
        compliance: ComplianceAgents {
            sanctions: config.agents.sanctions.unwrap_or(defaults.sanctions),
            liquidity: config.agents.liquidity.unwrap_or(defaults.liquidity),
            procedures: config.agents.procedures.unwrap_or(defaults.procedures),
        },
    };

    let default_topology = match config.orchestrator.default_topology {
        Some(name) => TopologyKind::from_name(&name)
            .with_context(|| format!("Unknown default_topology in config: {}", name))?,
        None => TopologyKind::Handoff,
    };
    let orchestrator = OrchestratorSettings {
        default_topology,
        checkpointing: config.orchestrator.checkpointing.unwrap_or(true),
        evidence_window: config.orchestrator.evidence_window.unwrap_or(10),
    };

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        retry: config.retry.unwrap_or_default(),
        events,
        agents,
        orchestrator,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".runbook");

    let file = match find_config_file() {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    resolve(
        default_home,
        file.as_ref().map(|(p, c)| (p.as_path(), c.clone())),
        |key| std::env::var(key).ok(),
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the runbook home directory
pub fn runbook_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the SQLite database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}

/// Get the checkpoint directory ($RUNBOOK_HOME/checkpoints)
pub fn checkpoints_dir() -> Result<PathBuf> {
    Ok(config()?.checkpoints_dir())
}
