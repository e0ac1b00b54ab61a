use crate::backend::local::LocalTransport;
use crate::backend::BackendKind;
use crate::error::ExecError;
use crate::execution::decoder::DecodePolicy;
use crate::execution::polling::DEFAULT_POLL_INTERVAL;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod loader;


pub use loader::ConfigLoader;

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "SANDBOX_STREAM_";

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine the user configuration directory")]
    NoConfigDir,

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl From<ConfigError> for ExecError {
    fn from(err: ConfigError) -> Self {
        ExecError::Config(err.to_string())
    }
}

/// Directory holding `config.toml` for the current user
pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("dev", "sandbox-stream", "sandbox-stream")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or(ConfigError::NoConfigDir)
}

/// Which backend a session execs through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        #[serde(default)]
        transport: LocalTransport,
    },
    /// Docker, or Podman through its Docker-compatible socket
    Docker {
        #[serde(default)]
        socket: Option<String>,
    },
    Kubernetes {
        #[serde(default = "default_namespace")]
        namespace: String,
        /// Container within the pod; the pod's default when unset
        #[serde(default)]
        container: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            transport: LocalTransport::default(),
        }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Local { .. } => BackendKind::Local,
            BackendConfig::Docker { .. } => BackendKind::Docker,
            BackendConfig::Kubernetes { .. } => BackendKind::Kubernetes,
        }
    }

    /// Default settings for the backend named `name`
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendConfig::default()),
            "docker" | "podman" => Ok(BackendConfig::Docker { socket: None }),
            "kubernetes" | "k8s" => Ok(BackendConfig::Kubernetes {
                namespace: default_namespace(),
                container: None,
            }),
            other => Err(ConfigError::InvalidValue {
                key: "backend".to_string(),
                value: other.to_string(),
                reason: "expected local, docker, podman or kubernetes".to_string(),
            }),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

/// Settings for one sandbox session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Stream output by default even without callbacks
    #[serde(default)]
    pub stream: bool,

    /// Decode error policy for command output
    #[serde(default)]
    pub encoding_errors: DecodePolicy,

    /// Per-command deadline, e.g. `"30s"`; unbounded when unset
    #[serde(default, with = "humantime_serde")]
    pub execution_timeout: Option<Duration>,

    /// Upper bound on one wait of the poll-based transport
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Stop a batch at the first command with a non-zero exit code
    #[serde(default)]
    pub stop_on_error: bool,

    /// Working directory for commands that do not name one
    #[serde(default)]
    pub workdir: Option<String>,

    /// Container (or pod) commands run in
    #[serde(default)]
    pub container: Option<String>,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream: false,
            encoding_errors: DecodePolicy::default(),
            execution_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_on_error: false,
            workdir: None,
            container: None,
            backend: BackendConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject settings that deserialize fine but cannot be used
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval".to_string(),
                value: humantime_serde::re::humantime::format_duration(self.poll_interval)
                    .to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Apply `SANDBOX_STREAM_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) -> Result<(), ConfigError> {
        self.merge_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` to read variables by full name
    pub fn merge_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("STREAM") {
            self.stream = parse_bool("STREAM", &value)?;
        }
        if let Some(value) = var("ENCODING_ERRORS") {
            self.encoding_errors = value
                .parse()
                .map_err(|reason: String| invalid("ENCODING_ERRORS", &value, reason))?;
        }
        if let Some(value) = var("TIMEOUT") {
            self.execution_timeout = parse_optional_duration("TIMEOUT", &value)?;
        }
        if let Some(value) = var("POLL_INTERVAL") {
            let interval = humantime_serde::re::humantime::parse_duration(&value)
                .map_err(|e| invalid("POLL_INTERVAL", &value, e.to_string()))?;
            if interval.is_zero() {
                return Err(invalid("POLL_INTERVAL", &value, "must be greater than zero"));
            }
            self.poll_interval = interval;
        }
        if let Some(value) = var("STOP_ON_ERROR") {
            self.stop_on_error = parse_bool("STOP_ON_ERROR", &value)?;
        }
        if let Some(value) = var("WORKDIR") {
            self.workdir = Some(value).filter(|dir| !dir.is_empty());
        }
        if let Some(value) = var("CONTAINER") {
            self.container = Some(value).filter(|name| !name.is_empty());
        }
        if let Some(value) = var("BACKEND") {
            let backend = BackendConfig::from_name(&value)?;
            // keep file-level settings when the variable names the same backend
            if backend.kind() != self.backend.kind() {
                self.backend = backend;
            }
        }
        if let Some(value) = var("DOCKER_SOCKET") {
            if let BackendConfig::Docker { socket } = &mut self.backend {
                *socket = Some(value);
            }
        }
        if let Some(value) = var("NAMESPACE") {
            if let BackendConfig::Kubernetes { namespace, .. } = &mut self.backend {
                *namespace = value;
            }
        }

        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

/// `"none"`, `"0"` or empty disables the deadline
fn parse_optional_duration(key: &str, value: &str) -> Result<Option<Duration>, ConfigError> {
    match value.trim() {
        "" | "0" | "none" => Ok(None),
        text => humantime_serde::re::humantime::parse_duration(text)
            .map(Some)
            .map_err(|e| invalid(key, value, e.to_string())),
    }
}
