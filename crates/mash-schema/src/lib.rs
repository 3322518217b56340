//! Formula model for mash.
//!
//! Everything a resolver needs to reason about a formula without touching
//! the network or the filesystem lives here: validated manifests, option
//! selections and their fingerprints, conditions, and the declared target
//! environment.

pub mod arch;
pub mod condition;
pub mod hash;
pub mod manifest;
pub mod options;
pub mod platform;
pub mod step;
pub mod types;
pub mod version;

// Re-exports
pub use arch::*;
pub use condition::{Condition, EvalContext, Predicate};
pub use hash::*;
pub use manifest::{
    ArchRequirement, CompilerFailure, Dependency, DependencyKind, FetchKind, Manifest, ParseError,
    Patch, PatchSource, Requirement, RequirementKind, Resource, SourceLocator,
};
pub use options::{ActiveOptions, BuildMode, OptionDecl, OptionFingerprint};
pub use platform::{Compiler, CompilerKind, Environment, Os};
pub use step::{Step, StepAction, TemplateError};
pub use types::*;
pub use version::detect_version;

/// File name of the receipt written into every keg.
pub const KEG_RECEIPT: &str = "KEG_RECEIPT.json";

/// Extension of manifest files inside a formula directory.
pub const MANIFEST_EXTENSION: &str = "toml";
