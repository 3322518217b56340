//! mash - build formulae from source
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Thin command line front end over `mash-core`.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.mash/
//! ├── formula/    # *.toml formulae
//! ├── cellar/     # kegs: <name>/<version>-<fingerprint>/
//! ├── opt/        # opt/<name> -> linked keg
//! ├── bottles/    # content-addressed bottle cache
//! ├── cache/      # verified downloads
//! ├── logs/       # logs of failed builds
//! └── config.toml
//! ```

pub mod cmd;
pub mod options;
pub mod ui;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub use options::OptionFlag;

#[derive(Debug, Parser)]
#[command(name = "mash")]
#[command(author, version, about = "mash - build formulae from source")]
#[command(after_help = "Formula options are passed as --with-X, --without-X, --enable-X or --disable-X.")]
pub struct Cli {
    /// Directory holding *.toml formulae
    #[arg(long, global = true, value_name = "DIR")]
    pub formula_dir: Option<PathBuf>,

    /// Maximum number of formulae built at once
    #[arg(short, long, global = true, value_name = "N")]
    pub jobs: Option<usize>,

    /// Keep build-only dependencies installed after the build
    #[arg(long, global = true)]
    pub keep_build_deps: bool,

    /// Formula option flags, split off before parsing
    #[arg(skip)]
    pub options: Vec<OptionFlag>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Build mode and universal flags shared by `install` and `plan`.
#[derive(Debug, Clone, Default, Args)]
pub struct BuildArgs {
    /// Build a universal (multi-architecture) binary
    #[arg(long)]
    pub universal: bool,

    /// Build from the formula's HEAD source
    #[arg(long = "HEAD", conflicts_with = "devel")]
    pub head: bool,

    /// Build the formula's development version
    #[arg(long)]
    pub devel: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build and install formulae
    Install {
        /// Formula names
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Print the build plan without building anything
    Plan {
        /// Formula names
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        build: BuildArgs,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every installed keg of a formula
    Uninstall {
        /// Formula name
        name: String,
    },
    /// Show a formula and its installed kegs
    Info {
        /// Formula name
        name: String,
    },
    /// List installed kegs
    List,
    /// Inspect the bottle cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cached bottles
    List,
    /// Re-hash every bottle and report corrupt entries
    Verify,
}

impl Cli {
    /// Parse `args`, splitting formula option flags off first.
    pub fn parse_with_options(args: impl IntoIterator<Item = String>) -> Self {
        let (rest, options) = options::split_option_flags(args);
        let mut cli = Self::parse_from(rest);
        cli.options = options;
        cli
    }
}
