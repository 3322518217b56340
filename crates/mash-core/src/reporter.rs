//! Reporter trait for dependency injection
//!
//! The executor reports progress through this trait so that it is not
//! coupled to any particular terminal output.

use mash_schema::{PackageName, Version};

/// Progress sink for plan execution.
pub trait Reporter: Send + Sync {
    /// A new phase started (e.g. "Resolving", "Building").
    fn section(&self, title: &str);

    /// A node is being fetched.
    fn fetching(&self, name: &PackageName, version: &Version);

    /// A node's install procedure started.
    fn building(&self, name: &PackageName, version: &Version);

    /// A step is about to run.
    fn step(&self, name: &PackageName, description: &str);

    /// A node finished. `detail` says how ("built", "cached", "installed").
    fn done(&self, name: &PackageName, version: &Version, detail: &str);

    /// A node failed.
    fn failed(&self, name: &PackageName, version: &Version, reason: &str);

    /// A node was skipped because an optional dependency failed.
    fn skipped(&self, name: &PackageName, reason: &str);

    /// A formula emitted a warning (`warn` step) or the executor did.
    fn warning(&self, msg: &str);

    /// Informational message.
    fn info(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn fetching(&self, name: &PackageName, version: &Version) {
        (**self).fetching(name, version);
    }
    fn building(&self, name: &PackageName, version: &Version) {
        (**self).building(name, version);
    }
    fn step(&self, name: &PackageName, description: &str) {
        (**self).step(name, description);
    }
    fn done(&self, name: &PackageName, version: &Version, detail: &str) {
        (**self).done(name, version, detail);
    }
    fn failed(&self, name: &PackageName, version: &Version, reason: &str) {
        (**self).failed(name, version, reason);
    }
    fn skipped(&self, name: &PackageName, reason: &str) {
        (**self).skipped(name, reason);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn fetching(&self, _: &PackageName, _: &Version) {}
    fn building(&self, _: &PackageName, _: &Version) {}
    fn step(&self, _: &PackageName, _: &str) {}
    fn done(&self, _: &PackageName, _: &Version, _: &str) {}
    fn failed(&self, _: &PackageName, _: &Version, _: &str) {}
    fn skipped(&self, _: &PackageName, _: &str) {}
    fn warning(&self, _: &str) {}
    fn info(&self, _: &str) {}
}
