//! Subcommands.

pub mod cache;
pub mod info;
pub mod install;
pub mod list;
pub mod plan;
pub mod uninstall;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use mash_core::{BottleCache, BuildPlan, Config, KegStore, ManifestSet, resolve};
use mash_schema::{Environment, PackageName};

use crate::options::{self, OptionFlag};
use crate::ui::Output;
use crate::{BuildArgs, Cli};

/// State shared by every subcommand: effective configuration and output.
#[derive(Clone)]
pub struct Context {
    pub config: Config,
    pub output: Arc<Output>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Load configuration and apply command line overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = Config::load().context("Failed to load configuration")?;
        if let Some(dir) = &cli.formula_dir {
            config.formula_dir.clone_from(dir);
        }
        if let Some(jobs) = cli.jobs {
            config.jobs = jobs.max(1);
        }
        if cli.keep_build_deps {
            config.keep_build_deps = true;
        }
        tracing::debug!(?config, "effective configuration");
        Ok(Self {
            config,
            output: Arc::new(Output::new()),
        })
    }

    /// Every formula in the formula directory.
    pub fn manifests(&self) -> Result<ManifestSet> {
        ManifestSet::load_dir(&self.config.formula_dir).with_context(|| {
            format!(
                "Failed to load formulae from {}",
                self.config.formula_dir.display()
            )
        })
    }

    pub fn kegs(&self) -> KegStore {
        KegStore::new(self.config.layout.clone())
    }

    pub fn cache(&self) -> BottleCache {
        BottleCache::new(self.config.layout.bottles())
    }

    /// Resolve `names` for the running host.
    pub fn plan(
        &self,
        names: &[String],
        build: &BuildArgs,
        flags: &[OptionFlag],
    ) -> Result<BuildPlan> {
        let manifests = self.manifests()?;
        let targets: Vec<PackageName> = names.iter().map(|n| PackageName::new(n)).collect();
        let selection = options::selection(&manifests, &targets, flags, build);
        let env: Environment = mash_core::host::detect();
        Ok(resolve(&manifests, &targets, &selection, &env)?)
    }
}
