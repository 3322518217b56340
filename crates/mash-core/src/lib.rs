pub mod builder;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod host;
pub mod keg;
pub mod paths;
pub mod plan;
pub mod registry;
pub mod resolver;
pub mod workdir;

pub mod reporter;

pub use cache::{BottleCache, CacheEntry, CacheKey};
pub use config::{Config, ConfigError};
pub use error::{BuildError, CacheError, FetchError, NodeError, NodeFailure, ResolutionError};
pub use executor::{ExecutionReport, Executor, NodeOutcome, Origin, Outcome};
pub use fetch::{Fetcher, SourceFetcher};
pub use keg::{Keg, KegReceipt, KegStore};
pub use paths::*;
pub use plan::{BuildPlan, OptionSelection, PlanEdge, PlanNode};
pub use registry::{ManifestSet, RegistryError};
pub use reporter::{NullReporter, Reporter};
pub use resolver::{Resolver, resolve};

/// User Agent string for downloads
pub const USER_AGENT: &str = concat!("mash/", env!("CARGO_PKG_VERSION"));
