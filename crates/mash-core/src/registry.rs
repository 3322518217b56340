//! The set of known formulae.

use std::collections::BTreeMap;
use std::path::Path;

use mash_schema::{MANIFEST_EXTENSION, Manifest, PackageName, ParseError};
use thiserror::Error;

use crate::error::ResolutionError;

/// Errors raised while loading a formula directory.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A manifest failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Two manifests share a name.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The directory could not be listed.
    #[error("failed to read formula directory {path}: {source}")]
    Io {
        /// Directory path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Name-indexed manifests. Iteration is in name order.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    manifests: BTreeMap<PackageName, Manifest>,
}

impl ManifestSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::DuplicateName`] if the name is taken.
    pub fn insert(&mut self, manifest: Manifest) -> Result<(), ResolutionError> {
        if self.manifests.contains_key(&manifest.name) {
            return Err(ResolutionError::DuplicateName {
                name: manifest.name.clone(),
            });
        }
        self.manifests.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    /// Build a set from manifests.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::DuplicateName`] on the first repeated name.
    pub fn from_manifests(
        manifests: impl IntoIterator<Item = Manifest>,
    ) -> Result<Self, ResolutionError> {
        let mut set = Self::new();
        for manifest in manifests {
            set.insert(manifest)?;
        }
        Ok(set)
    }

    /// Load every `*.toml` file of a directory (not recursive), in file name order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the directory cannot be read, a manifest
    /// is invalid, or two manifests share a name.
    pub fn load_dir(dir: &Path) -> Result<Self, RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == MANIFEST_EXTENSION)
            {
                files.push(path);
            }
        }
        files.sort();

        let mut set = Self::new();
        for file in files {
            let manifest = Manifest::from_file(&file)?;
            tracing::debug!(name = %manifest.name, path = %file.display(), "loaded formula");
            set.insert(manifest)?;
        }
        Ok(set)
    }

    /// Look up a manifest by (normalized) name.
    pub fn get(&self, name: &str) -> Option<&Manifest> {
        self.manifests.get(PackageName::new(name).as_str())
    }

    /// Whether `name` is known.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All manifests in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.manifests.values()
    }

    /// Number of manifests.
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}
