use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level configuration, loaded from `weft.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Presence of this section enables queued dispatch.
    #[serde(default)]
    pub queue: Option<QueueConfig>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Deployment mode; controls how much diagnostic detail node errors carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: DeploymentMode,
    /// A run with dispatches in flight but no state update for this long is deadlocked.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_ms: u64,
    /// Optional deadline for the whole run.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    /// Capacity of the run's output channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Upper bound on firings of a single node within one run (loop guard).
    #[serde(default = "default_max_firings")]
    pub max_firings_per_node: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            inactivity_timeout_ms: default_inactivity_timeout(),
            run_timeout_ms: None,
            event_capacity: default_event_capacity(),
            max_firings_per_node: default_max_firings(),
        }
    }
}

impl EngineConfig {
    pub fn verbose_errors(&self) -> bool {
        self.mode == DeploymentMode::Development
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms.max(1))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }
}

fn default_inactivity_timeout() -> u64 { 300_000 }
fn default_event_capacity() -> usize { 256 }
fn default_max_firings() -> u32 { 1000 }

/// Retry configuration for transport operations (remote delegation, queue publish).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 250 }
fn default_max_backoff() -> u64 { 10_000 }

/// Message broker settings for queued dispatch and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_url")]
    pub url: String,
    /// Prefix applied to every key.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name of the job queue.
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Dead-letter list; defaults to `<name>:dead`.
    #[serde(default)]
    pub dead_letter: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Blocking pop timeout; bounds how long a pooled connection is held.
    #[serde(default = "default_blocking_timeout")]
    pub blocking_timeout_secs: u64,
    /// Handler failures tolerated before a job is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Worker tasks started by `weft worker`.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Lifetime of a job's cancel flag.
    #[serde(default = "default_cancel_ttl")]
    pub cancel_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: default_queue_url(),
            namespace: default_namespace(),
            name: default_queue_name(),
            dead_letter: None,
            max_connections: default_max_connections(),
            blocking_timeout_secs: default_blocking_timeout(),
            max_deliveries: default_max_deliveries(),
            workers: default_workers(),
            cancel_ttl_secs: default_cancel_ttl(),
        }
    }
}

impl QueueConfig {
    pub fn dead_letter_name(&self) -> String {
        self.dead_letter
            .clone()
            .unwrap_or_else(|| format!("{}:dead", self.name))
    }
}

fn default_queue_url() -> String { "redis://127.0.0.1:6379/".to_string() }
fn default_namespace() -> String { "weft:".to_string() }
fn default_queue_name() -> String { "jobs".to_string() }
fn default_max_connections() -> usize { 16 }
fn default_blocking_timeout() -> u64 { 1 }
fn default_max_deliveries() -> u32 { 3 }
fn default_workers() -> usize { 4 }
fn default_cancel_ttl() -> u64 { 3600 }

/// Remote peers this process may delegate to, and the bind address when
/// serving as a peer itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            peers: vec![],
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
    /// Node types delegated to this peer.
    #[serde(default)]
    pub node_types: Vec<String>,
    #[serde(default = "default_peer_timeout")]
    pub timeout_secs: u64,
}

fn default_peer_timeout() -> u64 { 10 }

/// JSONL run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> String { "~/.weft/runs".to_string() }

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn dir_path(&self) -> PathBuf {
        if let Some(rest) = self.dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.dir)
    }
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }
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
                // Unset variables are left verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
