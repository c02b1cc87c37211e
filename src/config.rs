use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service identifier used in logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Tool subprocess configuration
    pub bridge: BridgeConfig,

    /// Session registry configuration
    #[serde(default)]
    pub sessions: SessionConfig,

    /// LLM endpoint configuration
    pub llm: LlmConfig,

    /// Internal account API configuration
    pub upstream: UpstreamConfig,

    /// Streaming pipeline configuration
    #[serde(default)]
    pub stream: StreamConfig,
}

/// How to launch and stop the per-session tool subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Executable to spawn for each session
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variable carrying the bound account id
    #[serde(default = "default_account_env")]
    pub account_env: String,
    /// Grace period between closing stdin and killing the process
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl BridgeConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Read from the environment when absent from the file
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the internal account API
    pub internal_api_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
}

impl StreamConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline(),
        }
    }
}

fn default_service_name() -> String {
    "finops-gateway".to_string()
}

fn default_account_env() -> String {
    "FINOPS_ACCOUNT_ID".to_string()
}

fn default_stop_grace() -> u64 {
    5
}

fn default_max_sessions() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_deadline() -> u64 {
    300
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            service = %config.service_name,
            bridge_command = %config.bridge.command,
            max_sessions = config.sessions.max_sessions,
            "configuration loaded"
        );
        Ok(config)
    }
}
