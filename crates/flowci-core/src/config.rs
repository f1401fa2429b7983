use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flowci configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Public base URL the agent uses to reach our webhooks.
    pub domain: String,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipelines: PipelinesConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Remote execution platform endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Execution zone tag attached to every command.
    pub zone: String,
    /// Direct dispatch endpoint (run commands).
    pub cmd: EndpointConfig,
    /// Queued dispatch endpoint (session commands).
    pub queue: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinesConfig {
    /// Directory holding one `<name>.toml` per pipeline.
    #[serde(default = "default_pipelines_dir")]
    pub dir: String,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            dir: default_pipelines_dir(),
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts made to see a freshly created job from a callback.
    #[serde(default = "default_retry_find_attempts")]
    pub retry_find_attempts: u32,
    /// Fixed wait between those attempts.
    #[serde(default = "default_retry_find_delay_ms")]
    pub retry_find_delay_ms: u64,
}

impl EngineConfig {
    pub fn retry_find_delay(&self) -> Duration {
        Duration::from_millis(self.retry_find_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_find_attempts: default_retry_find_attempts(),
            retry_find_delay_ms: default_retry_find_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

/// JSONL job event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_log_dir(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8080".to_string() }
fn default_db_path() -> String { "~/.flowci/flowci.db".to_string() }
fn default_pipelines_dir() -> String { "~/.flowci/pipelines".to_string() }
fn default_retry_find_attempts() -> u32 { 5 }
fn default_retry_find_delay_ms() -> u64 { 5000 }
fn default_http_timeout() -> u64 { 30 }
fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.flowci/logs".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("domain", &self.domain),
            ("platform.zone", &self.platform.zone),
            ("platform.cmd.url", &self.platform.cmd.url),
            ("platform.queue.url", &self.platform.queue.url),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(FlowError::Config(format!("{} must not be empty", key)));
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database.path)
    }

    pub fn pipelines_dir(&self) -> PathBuf {
        expand_home(&self.pipelines.dir)
    }

    /// Job event log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| expand_home(&l.dir))
    }
}

/// Expand a leading `~/`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
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
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
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
