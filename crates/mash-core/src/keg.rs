//! Installed kegs.
//!
//! A keg is the immutable install tree of one (name, version, option
//! fingerprint) triple:
//!
//! ```text
//! <home>/cellar/<name>/<version>-<fp16>/
//!   KEG_RECEIPT.json
//!   bin/ lib/ include/ share/ ...
//! <home>/opt/<name> -> ../cellar/<name>/<version>-<fp16>
//! ```
//!
//! Kegs are created by moving a finished staging prefix into the cellar in
//! one rename, so a keg directory either has a receipt or does not exist.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use mash_schema::{ActiveOptions, BuildMode, KEG_RECEIPT, OptionFingerprint, PackageName, Version};
use serde::{Deserialize, Serialize};

use crate::builder::{copy_dir_all, fix_absolute_symlinks, relative_path};
use crate::paths::Layout;

static LINK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Metadata written into every keg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KegReceipt {
    /// Formula name.
    pub name: PackageName,
    /// Installed version.
    pub version: Version,
    /// Option fingerprint (full hex).
    pub fingerprint: OptionFingerprint,
    /// Build mode.
    pub mode: BuildMode,
    /// Resolved options.
    pub options: ActiveOptions,
    /// Primary URL of the source that was built.
    pub source: String,
    /// Platform tag the keg was built for.
    pub platform: String,
    /// Whether the keg came out of the bottle cache.
    pub from_bottle: bool,
    /// Installation time.
    pub installed_at: DateTime<Utc>,
}

impl KegReceipt {
    /// Read the receipt of the keg at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the receipt is missing or malformed.
    pub fn read(dir: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(dir.join(KEG_RECEIPT))?;
        serde_json::from_str(&content).map_err(io::Error::other)
    }

    fn write(&self, dir: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(dir.join(KEG_RECEIPT), json)
    }
}

/// An installed keg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keg {
    /// Keg directory.
    pub path: PathBuf,
    /// Its receipt.
    pub receipt: KegReceipt,
}

impl Keg {
    /// Formula name.
    pub fn name(&self) -> &PackageName {
        &self.receipt.name
    }

    /// Installed version.
    pub fn version(&self) -> &Version {
        &self.receipt.version
    }
}

/// The cellar plus `opt/` links.
#[derive(Debug, Clone)]
pub struct KegStore {
    layout: Layout,
}

impl KegStore {
    /// Store rooted at `layout`'s cellar.
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Directory a keg with this identity lives in.
    pub fn keg_path(
        &self,
        name: &PackageName,
        version: &Version,
        fingerprint: &OptionFingerprint,
    ) -> PathBuf {
        self.layout
            .cellar_for(name)
            .join(format!("{version}-{}", fingerprint.short()))
    }

    /// The installed keg with this identity, if any.
    pub fn find(
        &self,
        name: &PackageName,
        version: &Version,
        fingerprint: &OptionFingerprint,
    ) -> Option<Keg> {
        let path = self.keg_path(name, version, fingerprint);
        let receipt = KegReceipt::read(&path).ok()?;
        (receipt.fingerprint == *fingerprint).then_some(Keg { path, receipt })
    }

    /// Move a finished staging prefix into the cellar and link `opt/<name>`.
    ///
    /// Absolute symlinks pointing into `staging` are rewritten relative
    /// first. If a keg with the same identity already exists it is kept and
    /// returned unchanged, except for HEAD kegs: their identity does not pin
    /// the sources, so a fresh HEAD build replaces the old tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be moved or linked.
    pub fn install_from(&self, staging: &Path, receipt: KegReceipt) -> io::Result<Keg> {
        if receipt.mode != BuildMode::Head
            && let Some(existing) = self.find(&receipt.name, &receipt.version, &receipt.fingerprint)
        {
            tracing::debug!(keg = %existing.path.display(), "keg already installed");
            self.link(&existing)?;
            return Ok(existing);
        }

        let target = self.keg_path(&receipt.name, &receipt.version, &receipt.fingerprint);
        if target.exists() {
            // An older HEAD build, or a leftover from an interrupted copy
            fs::remove_dir_all(&target)?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        fix_absolute_symlinks(staging, staging)?;
        receipt.write(staging)?;

        // Prefer rename (atomic on one filesystem) with copy fallback
        if fs::rename(staging, &target).is_err() {
            let mut partial = target.clone().into_os_string();
            partial.push(".partial");
            let partial = PathBuf::from(partial);
            fs::create_dir_all(&partial)?;
            copy_dir_all(staging, &partial)?;
            fs::rename(&partial, &target)?;
        }

        let keg = Keg {
            path: target,
            receipt,
        };
        self.link(&keg)?;
        tracing::info!(keg = %keg.path.display(), "installed keg");
        Ok(keg)
    }

    /// Point `opt/<name>` at `keg`, replacing any previous link atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be created.
    pub fn link(&self, keg: &Keg) -> io::Result<()> {
        let link = self.layout.opt_link(keg.name());
        let opt_dir = self.layout.opt();
        fs::create_dir_all(&opt_dir)?;

        let target = relative_path(&opt_dir, &keg.path);
        let seq = LINK_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp = opt_dir.join(format!(".{}.{}-{seq}.tmp", keg.name(), std::process::id()));
        if temp.symlink_metadata().is_ok() {
            fs::remove_file(&temp)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &temp)?;
        fs::rename(&temp, &link)
    }

    /// The keg `opt/<name>` currently points at.
    pub fn linked(&self, name: &PackageName) -> Option<Keg> {
        let link = self.layout.opt_link(name);
        let path = fs::canonicalize(&link).ok()?;
        let receipt = KegReceipt::read(&path).ok()?;
        Some(Keg { path, receipt })
    }

    /// All kegs of one formula, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the cellar directory cannot be read.
    pub fn kegs_of(&self, name: &PackageName) -> io::Result<Vec<Keg>> {
        let dir = self.layout.cellar_for(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut kegs: Vec<Keg> = fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                KegReceipt::read(&path).ok().map(|receipt| Keg { path, receipt })
            })
            .collect();
        kegs.sort_by(|a, b| {
            a.receipt
                .installed_at
                .cmp(&b.receipt.installed_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(kegs)
    }

    /// Every installed keg, by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the cellar cannot be read.
    pub fn list(&self) -> io::Result<Vec<Keg>> {
        let cellar = self.layout.cellar();
        if !cellar.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<PackageName> = fs::read_dir(&cellar)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .map(|e| PackageName::new(&e.file_name().to_string_lossy()))
            .collect();
        names.sort();

        let mut kegs = Vec::new();
        for name in names {
            kegs.extend(self.kegs_of(&name)?);
        }
        Ok(kegs)
    }

    /// Remove one keg. If `opt/<name>` pointed at it, the link moves to the
    /// newest remaining keg of that name or is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the keg or link cannot be removed.
    pub fn remove(&self, keg: &Keg) -> io::Result<()> {
        let canonical = fs::canonicalize(&keg.path)?;
        let was_linked = self
            .linked(keg.name())
            .is_some_and(|linked| linked.path == canonical);

        fs::remove_dir_all(&keg.path)?;
        tracing::info!(keg = %keg.path.display(), "removed keg");

        if was_linked {
            match self.kegs_of(keg.name())?.pop() {
                Some(newest) => self.link(&newest)?,
                None => self.unlink(keg.name())?,
            }
        }
        self.prune_empty(keg.name());
        Ok(())
    }

    /// Remove every keg of `name` and its `opt/` link.
    ///
    /// # Errors
    ///
    /// Returns an error if anything cannot be removed.
    pub fn uninstall(&self, name: &PackageName) -> io::Result<Vec<Keg>> {
        let kegs = self.kegs_of(name)?;
        for keg in &kegs {
            fs::remove_dir_all(&keg.path)?;
        }
        self.unlink(name)?;
        self.prune_empty(name);
        Ok(kegs)
    }

    fn unlink(&self, name: &PackageName) -> io::Result<()> {
        let link = self.layout.opt_link(name);
        if link.symlink_metadata().is_ok() {
            fs::remove_file(link)?;
        }
        Ok(())
    }

    fn prune_empty(&self, name: &PackageName) {
        let dir = self.layout.cellar_for(name);
        // Fails harmlessly when other kegs remain
        fs::remove_dir(dir).ok();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn receipt(name: &str, version: &str, opts: &[&str]) -> KegReceipt {
        let mut options = ActiveOptions::new();
        for opt in opts {
            options.set(*opt, true);
        }
        KegReceipt {
            name: PackageName::new(name),
            version: Version::from(version),
            fingerprint: options.fingerprint(BuildMode::Stable),
            mode: BuildMode::Stable,
            options,
            source: format!("https://example.com/{name}-{version}.tar.gz"),
            platform: "macos-14-arm64".to_string(),
            from_bottle: false,
            installed_at: Utc::now(),
        }
    }

    fn staging(root: &Path, label: &str) -> PathBuf {
        let dir = root.join(format!("staging-{label}"));
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/tool"), label).unwrap();
        dir
    }

    #[test]
    fn install_links_opt_and_finds_by_identity() {
        let tmp = tempdir().unwrap();
        let store = KegStore::new(Layout::new(tmp.path().join("home")));
        let r = receipt("zlib", "1.3", &[]);

        let keg = store
            .install_from(&staging(tmp.path(), "a"), r.clone())
            .unwrap();
        assert!(keg.path.ends_with(format!("cellar/zlib/1.3-{}", r.fingerprint.short())));
        assert!(keg.path.join(KEG_RECEIPT).is_file());

        let found = store.find(&r.name, &r.version, &r.fingerprint).unwrap();
        assert_eq!(found.receipt, r);
        assert_eq!(store.linked(&r.name).unwrap().path, fs::canonicalize(&keg.path).unwrap());
    }

    #[test]
    fn different_options_get_different_kegs() {
        let tmp = tempdir().unwrap();
        let store = KegStore::new(Layout::new(tmp.path().join("home")));
        let plain = receipt("curl", "8.0", &[]);
        let ssl = receipt("curl", "8.0", &["with-openssl"]);

        store.install_from(&staging(tmp.path(), "a"), plain.clone()).unwrap();
        store.install_from(&staging(tmp.path(), "b"), ssl.clone()).unwrap();

        assert_eq!(store.kegs_of(&plain.name).unwrap().len(), 2);
        // Most recently created keg wins the opt link
        let linked = store.linked(&plain.name).unwrap();
        assert_eq!(linked.receipt.fingerprint, ssl.fingerprint);
    }

    #[test]
    fn removing_linked_keg_relinks_remaining() {
        let tmp = tempdir().unwrap();
        let store = KegStore::new(Layout::new(tmp.path().join("home")));
        let old = receipt("pcre", "8.45", &[]);
        let new = receipt("pcre", "8.45", &["universal"]);

        store.install_from(&staging(tmp.path(), "a"), old.clone()).unwrap();
        let newer = store.install_from(&staging(tmp.path(), "b"), new).unwrap();

        store.remove(&newer).unwrap();
        assert_eq!(store.linked(&old.name).unwrap().receipt.fingerprint, old.fingerprint);

        let removed = store.uninstall(&old.name).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.linked(&old.name).is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn existing_keg_is_kept() {
        let tmp = tempdir().unwrap();
        let store = KegStore::new(Layout::new(tmp.path().join("home")));
        let r = receipt("xz", "5.4", &[]);

        let first = store.install_from(&staging(tmp.path(), "a"), r.clone()).unwrap();
        let second = store.install_from(&staging(tmp.path(), "b"), r).unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(fs::read_to_string(second.path.join("bin/tool")).unwrap(), "a");
    }
}
