use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the directory holding the configuration under the user config dir
const CONFIG_DIR_NAME: &str = "modelgate";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for backends
    #[serde(default)]
    pub defaults: BackendDefaults,

    /// Model backends keyed by the name clients put in the `model` field
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 12345)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest chunk relayed to the client for streaming responses (default: 8192)
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            stream_chunk_size: default_stream_chunk_size(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendDefaults {
    /// Executable used to launch backends
    #[serde(default = "default_command")]
    pub command: String,

    /// Health endpoint path polled during startup
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Budget in seconds for a backend to pass its first health check
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Delay between health probes in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Timeout of a single health probe in milliseconds
    #[serde(default = "default_health_probe_timeout")]
    pub health_probe_timeout_ms: u64,

    /// Seconds to wait for exit after SIGTERM before sending SIGKILL
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Seconds to wait for in-flight requests before stopping a backend
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Owner reported by the model listing endpoint
    #[serde(default = "default_owned_by")]
    pub owned_by: String,

    /// Artifact cache directory (overrides the Hugging Face cache lookup)
    pub cache_dir: Option<PathBuf>,
}

impl BackendDefaults {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            command: default_command(),
            health_path: default_health_path(),
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            health_probe_timeout_ms: default_health_probe_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            owned_by: default_owned_by(),
            cache_dir: None,
        }
    }
}

/// Configuration for a single model backend
///
/// # Security Warning
///
/// `command` and `args` are passed to a spawned process. Configuration files
/// must be protected with appropriate file permissions; a malicious file can
/// execute arbitrary code with the permissions of the proxy process.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelConfig {
    /// Artifact repository identifier (e.g. `org/name-GGUF`)
    pub repo: Option<String>,

    /// Explicit artifact filename inside the repository snapshot
    pub model_file: Option<String>,

    /// Launch arguments in declaration order
    pub args: Option<toml::Table>,

    /// Exempt this backend from eviction when another model is swapped in
    #[serde(default)]
    pub persist: bool,

    /// Executable override for this backend
    pub command: Option<String>,
}

impl ModelConfig {
    /// Create a model config with a repository and empty arguments
    pub fn new(repo: &str) -> Self {
        Self {
            repo: Some(repo.to_string()),
            args: Some(toml::Table::new()),
            ..Self::default()
        }
    }

    /// Set launch arguments (builder pattern)
    pub fn with_args(mut self, args: toml::Table) -> Self {
        self.args = Some(args);
        self
    }

    /// Mark the backend as persistent (builder pattern)
    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn command<'a>(&'a self, defaults: &'a BackendDefaults) -> &'a str {
        self.command.as_deref().unwrap_or(&defaults.command)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    12345
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for backend to respond
}

fn default_stream_chunk_size() -> usize {
    8192
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_command() -> String {
    "llama-server".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    500
}

fn default_health_probe_timeout() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    5 // between SIGTERM and SIGKILL
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_owned_by() -> String {
    "llamacpp".to_string()
}

/// Default configuration path: `$XDG_CONFIG_HOME/modelgate/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Config file not found or unreadable: {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.stream_chunk_size == 0 {
            errors.push("server.stream_chunk_size must be greater than 0".to_string());
        }
        if self.defaults.health_check_interval_ms == 0 {
            errors.push("defaults.health_check_interval_ms must be greater than 0".to_string());
        }
        if self.defaults.health_probe_timeout_ms == 0 {
            errors.push("defaults.health_probe_timeout_ms must be greater than 0".to_string());
        }
        if self.defaults.startup_timeout_secs == 0 {
            errors.push("defaults.startup_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
