//! Runtime configuration.
//!
//! Precedence, lowest first: built-in defaults, `<home>/config.toml`,
//! `MASH_*` environment variables, then whatever the CLI sets explicitly.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::paths::{Layout, try_mash_home};

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No home directory could be determined.
    #[error("could not determine home directory, set MASH_HOME to override")]
    NoHome,

    /// The config file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`FileConfig`].
    #[error("invalid config file {path}: {source}")]
    Toml {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// An environment variable holds an unusable value.
    #[error("invalid value for {var}: '{value}'")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Effective configuration of one mash invocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem layout.
    pub layout: Layout,
    /// Directory holding `*.toml` formulae.
    pub formula_dir: PathBuf,
    /// Maximum number of nodes built concurrently.
    pub jobs: usize,
    /// Keep build-only kegs after an execution.
    pub keep_build_deps: bool,
}

/// Shape of `<home>/config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Formula directory, relative paths are resolved against home.
    pub formula_dir: Option<PathBuf>,
    /// Worker pool size.
    pub jobs: Option<usize>,
    /// Keep build-only kegs.
    pub keep_build_deps: Option<bool>,
}

impl Config {
    /// Defaults for a given home, without reading anything.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let layout = Layout::new(home);
        Self {
            formula_dir: layout.home().join("formula"),
            layout,
            jobs: num_cpus::get().max(1),
            keep_build_deps: false,
        }
    }

    /// Load defaults, the config file and environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the home directory cannot be resolved,
    /// the config file is malformed, or an override is not parseable.
    pub fn load() -> Result<Self, ConfigError> {
        let home = try_mash_home().ok_or(ConfigError::NoHome)?;
        let mut config = Self::with_home(home);
        let file = config.layout.config_file();
        config.merge_file(&file)?;
        config.merge_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply `<home>/config.toml` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let file: FileConfig = toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(dir) = file.formula_dir {
            self.formula_dir = self.layout.home().join(dir);
        }
        if let Some(jobs) = file.jobs {
            self.jobs = jobs.max(1);
        }
        if let Some(keep) = file.keep_build_deps {
            self.keep_build_deps = keep;
        }
        Ok(())
    }

    /// Apply `MASH_JOBS`, `MASH_KEEP_BUILD_DEPS` and `MASH_FORMULA_DIR`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] for values that do not parse.
    pub fn merge_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MASH_JOBS") {
            self.jobs = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|j| *j > 0)
                .ok_or(ConfigError::Env {
                    var: "MASH_JOBS",
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup("MASH_KEEP_BUILD_DEPS") {
            self.keep_build_deps = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "MASH_KEEP_BUILD_DEPS",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("MASH_FORMULA_DIR") {
            self.formula_dir = PathBuf::from(value);
        }
        Ok(())
    }
}
