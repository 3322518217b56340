//! Scoped working directories for one node build.
//!
//! A [`WorkDir`] lives under `<home>/tmp` so that the final rename of the
//! staging prefix into the cellar stays on one filesystem. It is removed
//! when dropped, on success, failure and cancellation alike.

use std::io;
use std::path::{Path, PathBuf};

/// A disposable build directory.
///
/// ```text
/// <tmp>/mash-<name>-XXXX/
///   download/    fetched archives and patch files
///   src/         extracted source tree (the build path)
///   resources/   staged auxiliary resources
///   prefix/      staging install prefix
/// ```
#[derive(Debug)]
pub struct WorkDir {
    temp_dir: tempfile::TempDir,
}

impl WorkDir {
    /// Create a new working directory under `tmp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or its layout cannot be created.
    pub fn new(tmp: &Path, name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(tmp)?;
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("mash-{name}-"))
            .tempdir_in(tmp)?;

        let dir = Self { temp_dir };
        for sub in [dir.download(), dir.src(), dir.resources(), dir.prefix()] {
            std::fs::create_dir_all(sub)?;
        }
        Ok(dir)
    }

    /// Access the root path
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Where fetched files land before extraction.
    pub fn download(&self) -> PathBuf {
        self.path().join("download")
    }

    /// Extraction / checkout root.
    pub fn src(&self) -> PathBuf {
        self.path().join("src")
    }

    /// Staged resources: `resources/<name>`.
    pub fn resources(&self) -> PathBuf {
        self.path().join("resources")
    }

    /// Staging install prefix.
    pub fn prefix(&self) -> PathBuf {
        self.path().join("prefix")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn removed_on_drop() {
        let tmp = tempdir().unwrap();
        let root = {
            let dir = WorkDir::new(tmp.path(), "zlib").unwrap();
            assert!(dir.prefix().is_dir());
            assert!(dir.src().is_dir());
            assert!(
                dir.path()
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("mash-zlib-")
            );
            dir.path().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn removed_on_unwind() {
        let tmp = tempdir().unwrap();
        let tmp_path = tmp.path().to_path_buf();
        let result = std::panic::catch_unwind(move || {
            let dir = WorkDir::new(&tmp_path, "boom").unwrap();
            std::fs::write(dir.src().join("file"), "x").unwrap();
            panic!("build blew up");
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
