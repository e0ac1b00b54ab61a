use super::{get_config_dir, ConfigError, SessionConfig};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;

/// Loads [`SessionConfig`] from TOML and environment overrides
pub struct ConfigLoader {
    config: Arc<RwLock<SessionConfig>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(SessionConfig::default())),
        }
    }

    /// Path of the per-user configuration file
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(get_config_dir()?.join("config.toml"))
    }

    /// Load the per-user file if it exists, then apply the environment
    pub async fn load_global(&self) -> Result<(), ConfigError> {
        let path = Self::default_path()?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            self.replace(Self::read(&path).await?);
        }
        self.merge_env_vars()
    }

    /// Load `path`, which must exist, then apply the environment
    pub async fn load_with_explicit_path(&self, path: &Path) -> Result<(), ConfigError> {
        self.replace(Self::read(path).await?);
        self.merge_env_vars()
    }

    /// Explicit file when given, per-user file otherwise
    pub async fn load(&self, path: Option<&Path>) -> Result<(), ConfigError> {
        match path {
            Some(path) => self.load_with_explicit_path(path).await,
            None => self.load_global().await,
        }
    }

    pub fn get_config(&self) -> SessionConfig {
        self.config
            .read()
            .map(|config| config.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn update_config<F>(&self, update: F)
    where
        F: FnOnce(&mut SessionConfig),
    {
        let mut config = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut config);
    }

    fn replace(&self, config: SessionConfig) {
        self.update_config(|current| *current = config);
        tracing::debug!("Loaded session configuration");
    }

    fn merge_env_vars(&self) -> Result<(), ConfigError> {
        let mut config = self.get_config();
        config.merge_env_vars()?;
        self.replace(config);
        Ok(())
    }

    async fn read(path: &Path) -> Result<SessionConfig, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: SessionConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Read configuration file");
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
