use crate::backup::process::ToolCommand;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL
    pub database_url: String,

    /// Backup tool invocation
    pub restic: ToolCommand,

    /// How often watched paths are sampled
    pub poll_interval: Duration,

    /// Where the host filesystem is mounted when running in a container
    pub host_prefix: Option<PathBuf>,

    /// Start a backup for drives already present when they are registered
    pub backup_on_register: bool,
}

impl Default for Config {
    fn default() -> Self {
        let database = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autoback")
            .join("autoback.db");

        Self {
            database_url: format!("sqlite://{}", database.display()),
            restic: ToolCommand::default(),
            poll_interval: Duration::from_secs(1),
            host_prefix: None,
            backup_on_register: false,
        }
    }
}

impl Config {
    /// Load config from environment
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(db_url) = lookup("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Some(command) = lookup("RESTIC_COMMAND").as_deref().and_then(ToolCommand::parse) {
            config.restic = command;
        }

        if let Some(interval) = lookup("POLL_INTERVAL") {
            config.poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("invalid POLL_INTERVAL {:?}", interval))?;
        }

        if let Some(prefix) = lookup("PUBLIC_HOST_PREFIX").filter(|p| !p.is_empty()) {
            config.host_prefix = Some(PathBuf::from(prefix));
        }

        if let Some(flag) = lookup("BACKUP_ON_REGISTER") {
            config.backup_on_register = flag
                .parse()
                .with_context(|| format!("invalid BACKUP_ON_REGISTER {:?}", flag))?;
        }

        Ok(config)
    }

    /// Where a logical path lives on the filesystem this process sees.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        match &self.host_prefix {
            Some(prefix) => prefix.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
