//! Tool configuration, read from an optional `frog.toml`. Every section
//! has working defaults; command-line flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fact_cache::{CacheError, FactCache};
use crate::remoteenv::{Settings, DEFAULT_DIRECTORY};

pub const DEFAULT_FACT_CACHE_DIR: &str = "/tmp/frog-facts-cache";
pub const DEFAULT_FACT_CACHE_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bootstrap: BootstrapSection,
    pub fact_cache: FactCacheSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSection {
    pub directory: PathBuf,
    pub clean: bool,
}

impl Default for BootstrapSection {
    fn default() -> Self {
        BootstrapSection {
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            clean: false,
        }
    }
}

impl BootstrapSection {
    pub fn settings(&self) -> Settings {
        Settings::new(&self.directory, self.clean)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCacheKind {
    #[default]
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactCacheSection {
    #[serde(rename = "type")]
    pub kind: FactCacheKind,
    pub directory: PathBuf,
    pub lifetime_secs: u64,
}

impl Default for FactCacheSection {
    fn default() -> Self {
        FactCacheSection {
            kind: FactCacheKind::Memory,
            directory: PathBuf::from(DEFAULT_FACT_CACHE_DIR),
            lifetime_secs: DEFAULT_FACT_CACHE_LIFETIME_SECS,
        }
    }
}

impl FactCacheSection {
    pub fn build(&self) -> Result<FactCache, CacheError> {
        match self.kind {
            FactCacheKind::Memory => Ok(FactCache::memory()),
            FactCacheKind::Filesystem => {
                FactCache::filesystem(&self.directory, Duration::from_secs(self.lifetime_secs))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection { level: "info".into() }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })
    }

    /// Load the given file, or fall back to defaults when none was given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = Config::load_or_default(None).unwrap();
        assert_eq!(config.bootstrap.directory, PathBuf::from(DEFAULT_DIRECTORY));
        assert_eq!(config.fact_cache.kind, FactCacheKind::Memory);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_files_keep_defaults_for_the_rest() {
        let config: Config = toml::from_str(
            r#"
            [fact_cache]
            type = "filesystem"
            lifetime_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.fact_cache.kind, FactCacheKind::Filesystem);
        assert_eq!(config.fact_cache.lifetime_secs, 60);
        assert_eq!(
            config.fact_cache.directory,
            PathBuf::from(DEFAULT_FACT_CACHE_DIR)
        );
        assert!(!config.bootstrap.clean);
    }
}
