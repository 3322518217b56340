use dirs::home_dir;
use std::path::{Path, PathBuf};

use mash_schema::{PackageName, Version};

/// Returns the mash home directory, or None if the user's home cannot be resolved.
///
/// `MASH_HOME` wins over the default `~/.mash`.
pub fn try_mash_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("MASH_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".mash"))
}

/// Every on-disk location mash uses, derived from a single home directory.
///
/// ```text
/// <home>/
///   cellar/<name>/<version>-<fp16>/   installed kegs
///   opt/<name> -> ../cellar/...       stable per-name symlinks
///   bottles/entries/...               bottle cache index
///   bottles/blobs/<sha256>            bottle cache blobs
///   cache/downloads/<sha256>-<file>   verified source downloads
///   logs/                             build logs
///   tmp/                              scoped working directories
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    /// Layout rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Root directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Installed kegs: `<home>/cellar`
    pub fn cellar(&self) -> PathBuf {
        self.home.join("cellar")
    }

    /// All kegs of one formula: `<home>/cellar/<name>`
    pub fn cellar_for(&self, name: &PackageName) -> PathBuf {
        self.cellar().join(name)
    }

    /// Stable symlinks: `<home>/opt`
    pub fn opt(&self) -> PathBuf {
        self.home.join("opt")
    }

    /// Stable symlink of one formula: `<home>/opt/<name>`
    pub fn opt_link(&self, name: &PackageName) -> PathBuf {
        self.opt().join(name)
    }

    /// Bottle cache root: `<home>/bottles`
    pub fn bottles(&self) -> PathBuf {
        self.home.join("bottles")
    }

    /// Verified source downloads: `<home>/cache/downloads`
    pub fn download_cache(&self) -> PathBuf {
        self.home.join("cache").join("downloads")
    }

    /// Logs directory: `<home>/logs`
    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Generate a build log path for a package
    pub fn build_log_path(&self, package: &PackageName, version: &Version) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        self.log_dir()
            .join(format!("build-{package}-{version}-{timestamp}.log"))
    }

    /// Temp path: `<home>/tmp` (same volume as the cellar, so renames are atomic)
    pub fn tmp(&self) -> PathBuf {
        self.home.join("tmp")
    }

    /// Optional configuration file: `<home>/config.toml`
    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.toml")
    }
}

/// Extract the filename from a URL.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .split('/')
        .next_back()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_derives_everything_from_home() {
        let layout = Layout::new("/tmp/mash-home");
        let name = PackageName::new("Readline");

        assert_eq!(
            layout.opt_link(&name),
            PathBuf::from("/tmp/mash-home/opt/readline")
        );
        assert_eq!(
            layout.cellar_for(&name),
            PathBuf::from("/tmp/mash-home/cellar/readline")
        );
        assert!(layout.download_cache().starts_with(layout.home()));
    }

    #[test]
    fn filename_ignores_query_and_fragment() {
        assert_eq!(
            filename_from_url("https://e.com/a/x-1.0.tar.gz?dl=1"),
            "x-1.0.tar.gz"
        );
        assert_eq!(filename_from_url("https://e.com/repo.git/"), "repo.git");
    }
}
