//! Error taxonomy for resolution, fetching, building and caching.
//!
//! Parse and resolution errors are fatal before any build work starts.
//! Fetch and build errors are scoped to one plan node and wrapped in
//! [`NodeError`] so the causal chain always names the node. Cache errors
//! never escape the cache: they are logged and turned into misses.

use std::path::PathBuf;

use mash_schema::{PackageName, TemplateError};
use thiserror::Error;

/// Failures of dependency resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The active dependency graph has a cycle. `path` starts and ends with
    /// the same name.
    #[error("dependency cycle: {}", join(.path))]
    Cycle {
        /// Names along the cycle.
        path: Vec<PackageName>,
    },

    /// Two formulae in the plan conflict. `a < b`.
    #[error("{a} conflicts with {b}{}", parenthesized(.because.as_deref()))]
    Conflict {
        /// Lexicographically smaller name.
        a: PackageName,
        /// Lexicographically larger name.
        b: PackageName,
        /// Reason given by the declaration.
        because: Option<String>,
    },

    /// A formula cannot be built for the requested options or environment.
    #[error("{name} cannot be built: {reason}")]
    Unsatisfiable {
        /// Offending formula.
        name: PackageName,
        /// Why.
        reason: String,
    },

    /// Two manifests share a name.
    #[error("duplicate formula name '{name}'")]
    DuplicateName {
        /// Duplicated name.
        name: PackageName,
    },

    /// A target or dependency has no manifest.
    #[error("no formula named '{name}'{}", required_by_suffix(.required_by.as_ref()))]
    UnknownPackage {
        /// Missing name.
        name: PackageName,
        /// Dependent that referenced it, `None` for a requested target.
        required_by: Option<PackageName>,
    },
}

fn parenthesized(text: Option<&str>) -> String {
    text.map(|t| format!(" ({t})")).unwrap_or_default()
}

fn required_by_suffix(dependent: Option<&PackageName>) -> String {
    dependent
        .map(|d| format!(" (required by {d})"))
        .unwrap_or_default()
}

fn exit_code_text(code: Option<&i32>) -> String {
    code.map_or_else(|| "none (signal)".to_string(), ToString::to_string)
}

fn join(path: &[PackageName]) -> String {
    path.iter()
        .map(PackageName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failures while obtaining a source tree.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The downloaded bytes do not hash to the declared checksum.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// URL that produced the bytes.
        url: String,
        /// Declared SHA-256.
        expected: String,
        /// Computed SHA-256.
        actual: String,
    },

    /// Every URL (primary and mirrors) failed at the transport level.
    #[error("failed to download {url}: {reason}")]
    Network {
        /// Last URL tried.
        url: String,
        /// Transport error.
        reason: String,
    },

    /// A version control checkout failed.
    #[error("{tool} checkout of {url} failed: {reason}")]
    Vcs {
        /// `git`, `hg`, ...
        tool: &'static str,
        /// Repository URL.
        url: String,
        /// Exit status or spawn error with captured output.
        reason: String,
    },

    /// Archive extraction failed.
    #[error("failed to extract {}: {reason}", .path.display())]
    Extract {
        /// Archive path.
        path: PathBuf,
        /// Why.
        reason: String,
    },

    /// Local filesystem failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

/// Failures while running an install procedure or snapshotting its result.
#[derive(Error, Debug)]
pub enum BuildError {
    /// A process exited non-zero (or was killed by a signal).
    #[error("step `{step}` failed with exit code {}\n{output}", exit_code_text(.exit_code.as_ref()))]
    StepFailed {
        /// Step description.
        step: String,
        /// Exit code, `None` when terminated by a signal.
        exit_code: Option<i32>,
        /// Tail of the captured output.
        output: String,
    },

    /// A process could not be started.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An `inreplace` step did not apply.
    #[error("inreplace {}: {reason}", .file.display())]
    Inreplace {
        /// Target file.
        file: PathBuf,
        /// Why.
        reason: String,
    },

    /// A step argument could not be expanded.
    #[error("step `{step}`: {source}")]
    Template {
        /// Step description.
        step: String,
        /// Expansion failure.
        #[source]
        source: TemplateError,
    },

    /// The install procedure succeeded but installed nothing.
    #[error("empty installation: nothing was installed into the prefix")]
    EmptyInstallation,

    /// The execution was cancelled while this node was in flight.
    #[error("cancelled")]
    Cancelled,

    /// Local filesystem failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

/// Cache failures. Recovered locally: a corrupt entry is a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Entry or blob missing, unreadable or not matching its checksum.
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt {
        /// Entry key.
        key: String,
        /// What is wrong.
        reason: String,
    },

    /// Local filesystem failure.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry metadata could not be (de)serialized.
    #[error("cache metadata error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// What went wrong inside one node.
#[derive(Error, Debug)]
pub enum NodeFailure {
    /// Fetching the source or a resource.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Running the install procedure or creating the keg.
    #[error(transparent)]
    Build(#[from] BuildError),
}

impl NodeFailure {
    /// Whether this failure is a cancellation rather than a real error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Build(BuildError::Cancelled))
    }
}

/// A per-node failure, naming the node.
#[derive(Error, Debug)]
#[error("failed to build {name}: {source}")]
pub struct NodeError {
    /// Failed formula.
    pub name: PackageName,
    /// Cause.
    #[source]
    pub source: NodeFailure,
}

impl NodeError {
    /// Wrap a failure for `name`.
    pub fn new(name: PackageName, source: impl Into<NodeFailure>) -> Self {
        Self {
            name,
            source: source.into(),
        }
    }
}
