use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level Weft configuration (`weft.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running steps per run.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Run-level wall clock limit.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    /// How long in-flight steps get to observe cancellation before they are aborted.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_duration_secs: default_max_duration(),
            cancel_grace_ms: default_cancel_grace_ms(),
            default_max_attempts: default_max_attempts(),
            workflows_dir: default_workflows_dir(),
        }
    }
}

fn default_max_in_flight() -> usize { 8 }
fn default_max_duration() -> u64 { 600 }
fn default_cancel_grace_ms() -> u64 { 2000 }
fn default_max_attempts() -> u32 { 1 }
fn default_workflows_dir() -> String { "workflows".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failure fraction over the rolling window that opens the circuit.
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Calls needed in the window before the rate rule applies.
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate(),
            window_size: default_window_size(),
            min_calls: default_min_calls(),
            cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_failure_rate() -> f64 { 0.5 }
fn default_window_size() -> usize { 20 }
fn default_min_calls() -> usize { 10 }
fn default_cooldown_ms() -> u64 { 30_000 }
fn default_max_cooldown_ms() -> u64 { 300_000 }

/// A named tier: an ordered list of backends, cheapest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    #[serde(default)]
    pub backends: Vec<String>,
    /// Tier tried next when every backend here is exhausted and the step asks to escalate.
    #[serde(default)]
    pub escalate_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// "http" or "echo".
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    /// Empty means the backend serves any capability.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl BackendConfig {
    pub fn supports(&self, capability: Option<&str>) -> bool {
        match capability {
            None => true,
            Some(_) if self.capabilities.is_empty() => true,
            Some(cap) => self.capabilities.iter().any(|c| c == cap),
        }
    }
}

fn default_backend_kind() -> String { "http".to_string() }
fn default_backend_timeout() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.weft/runs.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.weft/logs".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every API call when set.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references between tiers and backends.
    pub fn validate(&self) -> Result<()> {
        for tier in &self.tiers {
            for backend in &tier.backends {
                if self.backend(backend).is_none() {
                    return Err(WeftError::Config(format!(
                        "tier '{}' references unknown backend '{}'",
                        tier.name, backend
                    )));
                }
            }
            if let Some(next) = &tier.escalate_to {
                if self.tier(next).is_none() {
                    return Err(WeftError::Config(format!(
                        "tier '{}' escalates to unknown tier '{}'",
                        tier.name, next
                    )));
                }
            }
        }
        for backend in &self.backends {
            if backend.timeout_secs == 0 {
                return Err(WeftError::Config(format!(
                    "backend '{}' must have timeout_secs of at least 1",
                    backend.name
                )));
            }
        }
        if self.engine.max_in_flight == 0 {
            return Err(WeftError::Config(
                "engine.max_in_flight must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        expand_home(&self.engine.workflows_dir)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| expand_home(&l.log_dir))
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
