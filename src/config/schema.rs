use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use sqlx::sqlite::SqliteJournalMode;

use crate::repository::sqlite::SqliteSettings;

pub const ENV_PREFIX: &str = "PETREL";

/// Upper bound for `query.max_per_page`, regardless of what the config asks for
pub const PER_PAGE_HARD_CAP: u32 = 500;

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct PetrelConfig {
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub query: Query,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    #[default]
    Wal,
    Off,
}

impl From<JournalMode> for SqliteJournalMode {
    fn from(mode: JournalMode) -> Self {
        match mode {
            JournalMode::Delete => SqliteJournalMode::Delete,
            JournalMode::Truncate => SqliteJournalMode::Truncate,
            JournalMode::Persist => SqliteJournalMode::Persist,
            JournalMode::Memory => SqliteJournalMode::Memory,
            JournalMode::Wal => SqliteJournalMode::Wal,
            JournalMode::Off => SqliteJournalMode::Off,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Database {
    pub dsn: String,
    pub journal_mode: JournalMode,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            dsn: "sqlite://petrel.sqlite".to_string(),
            journal_mode: JournalMode::default(),
            max_connections: 8,
            busy_timeout_ms: 5000,
        }
    }
}

impl Database {
    pub fn in_memory() -> Self {
        Self {
            dsn: "sqlite::memory:".to_string(),
            journal_mode: JournalMode::Memory,
            ..Default::default()
        }
    }

    pub fn settings(&self) -> SqliteSettings {
        SqliteSettings {
            dsn: self.dsn.clone(),
            journal_mode: self.journal_mode.into(),
            max_connections: self.max_connections,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Query {
    pub default_per_page: u32,
    pub max_per_page: u32,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            default_per_page: 30,
            max_per_page: PER_PAGE_HARD_CAP,
        }
    }
}

impl PetrelConfig {
    pub fn in_memory() -> Self {
        Self {
            database: Database::in_memory(),
            query: Query::default(),
        }
    }
}

pub fn validate_config(config: PetrelConfig) -> Result<PetrelConfig, ConfigError> {
    if config.database.dsn.is_empty() {
        return Err(ConfigError::Message(
            "database.dsn must not be empty".to_string(),
        ));
    }

    if config.database.max_connections == 0 {
        return Err(ConfigError::Message(
            "database.max_connections must be at least 1".to_string(),
        ));
    }

    let query = &config.query;
    if query.max_per_page == 0 || query.max_per_page > PER_PAGE_HARD_CAP {
        return Err(ConfigError::Message(format!(
            "query.max_per_page must be between 1 and {PER_PAGE_HARD_CAP}"
        )));
    }
    if query.default_per_page == 0 || query.default_per_page > query.max_per_page {
        return Err(ConfigError::Message(
            "query.default_per_page must be between 1 and query.max_per_page".to_string(),
        ));
    }

    Ok(config)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

/// Load the config file at `path`, with `PETREL__SECTION__KEY` environment
/// variables taking precedence over it
pub fn load_config(path: &Path) -> Result<PetrelConfig, ConfigError> {
    let path = path
        .to_str()
        .ok_or_else(|| ConfigError::Message(format!("Error parsing path {path:?}")))?;

    let config = Config::builder()
        .add_source(File::with_name(path))
        .add_source(environment());

    config.build()?.try_deserialize().and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
) -> Result<PetrelConfig, ConfigError> {
    let config =
        Config::builder().add_source(File::from_str(config_str, FileFormat::Toml));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
