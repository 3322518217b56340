//! Content-addressed bottle cache.
//!
//! ```text
//! <home>/bottles/
//!   entries/<name>/<version>/<platform>/<fingerprint>.json
//!   blobs/<sha256>            tar.zst of a keg tree
//! ```
//!
//! Entries are immutable once written. Every read re-hashes the blob; a
//! missing or mismatching blob is [`CacheError::Corrupt`], which
//! [`BottleCache::get`] logs and turns into a miss.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mash_schema::{Environment, OptionFingerprint, PackageName, Sha256Digest, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::CacheError;
use crate::plan::PlanNode;

/// zstd level used for bottles.
const COMPRESSION_LEVEL: i32 = 3;

/// Identity of a cached build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Formula name.
    pub name: PackageName,
    /// Built version.
    pub version: Version,
    /// Target platform tag.
    pub platform: String,
    /// Option fingerprint.
    pub fingerprint: OptionFingerprint,
}

impl CacheKey {
    /// Key of a plan node built for `env`.
    pub fn for_node(node: &PlanNode, env: &Environment) -> Self {
        Self {
            name: node.name().clone(),
            version: node.version.clone(),
            platform: env.platform_tag(),
            fingerprint: node.fingerprint.clone(),
        }
    }

    fn relative_entry_path(&self) -> PathBuf {
        PathBuf::from(self.name.as_str())
            .join(self.version.as_str())
            .join(&self.platform)
            .join(format!("{}.json", self.fingerprint))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.name,
            self.version,
            self.platform,
            self.fingerprint.short()
        )
    }
}

/// Metadata of one cached bottle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// What was built.
    pub key: CacheKey,
    /// SHA-256 of the blob.
    pub sha256: Sha256Digest,
    /// Blob size in bytes.
    pub size: u64,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// A verified cache hit.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Entry metadata.
    pub entry: CacheEntry,
    /// Blob path (already re-hashed).
    pub blob: PathBuf,
}

impl Artifact {
    /// Unpack the bottle into `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be decompressed or unpacked.
    pub fn unpack(&self, dest: &Path) -> Result<(), CacheError> {
        fs::create_dir_all(dest)?;
        let decoder = zstd::stream::Decoder::new(BufReader::new(File::open(&self.blob)?))?;
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive.unpack(dest)?;
        Ok(())
    }
}

/// The bottle cache.
#[derive(Debug, Clone)]
pub struct BottleCache {
    root: PathBuf,
}

impl BottleCache {
    /// Cache rooted at `root` (normally `<home>/bottles`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir().join(key.relative_entry_path())
    }

    fn blob_path(&self, sha256: &Sha256Digest) -> PathBuf {
        self.blobs_dir().join(sha256.as_str())
    }

    /// Look up `key`. Corruption is logged and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Artifact> {
        match self.lookup(key) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "ignoring corrupt cache entry");
                None
            }
        }
    }

    /// Look up `key`, surfacing corruption.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] when the entry is unreadable or its
    /// blob is missing or does not match the recorded checksum.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<Artifact>, CacheError> {
        let path = self.entry_path(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_str(&content).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            reason: format!("unreadable entry: {e}"),
        })?;
        if entry.key != *key {
            return Err(CacheError::Corrupt {
                key: key.to_string(),
                reason: "entry describes a different build".to_string(),
            });
        }
        self.verified(entry).map(Some)
    }

    fn verified(&self, entry: CacheEntry) -> Result<Artifact, CacheError> {
        let blob = self.blob_path(&entry.sha256);
        let corrupt = |reason: String| CacheError::Corrupt {
            key: entry.key.to_string(),
            reason,
        };
        let actual = match sha256_file(&blob) {
            Ok(actual) => actual,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(corrupt("blob is missing".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !entry.sha256.matches(&actual) {
            return Err(corrupt(format!(
                "blob checksum mismatch: expected {}, got {actual}",
                entry.sha256
            )));
        }
        Ok(Artifact { entry, blob })
    }

    /// Pack `tree` and register it under `key`.
    ///
    /// A valid existing entry is kept and returned; a corrupt one is
    /// replaced. Blob and entry are written through temp files and renamed
    /// into place.
    ///
    /// # Errors
    ///
    /// Returns an error if packing or writing fails.
    pub fn put(&self, key: &CacheKey, tree: &Path) -> Result<CacheEntry, CacheError> {
        match self.lookup(key) {
            Ok(Some(existing)) => {
                tracing::debug!(key = %key, "cache entry already present");
                return Ok(existing.entry);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "replacing corrupt cache entry"),
        }

        let blobs = self.blobs_dir();
        fs::create_dir_all(&blobs)?;

        let packed = NamedTempFile::new_in(&blobs)?;
        pack_tree(tree, packed.as_file())?;
        let sha256 = Sha256Digest::new(sha256_file(packed.path())?).map_err(|reason| {
            CacheError::Corrupt {
                key: key.to_string(),
                reason,
            }
        })?;
        let size = packed.as_file().metadata()?.len();

        let blob = self.blob_path(&sha256);
        let intact = sha256_file(&blob).is_ok_and(|actual| sha256.matches(&actual));
        if intact {
            // Same bytes already stored under this address
            drop(packed);
        } else {
            packed.persist(&blob).map_err(|e| CacheError::Io(e.error))?;
        }

        let entry = CacheEntry {
            key: key.clone(),
            sha256,
            size,
            created_at: Utc::now(),
        };
        let path = self.entry_path(key);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, &entry)?;
        temp.persist(&path).map_err(|e| CacheError::Io(e.error))?;

        tracing::info!(key = %key, size, "cached bottle");
        Ok(entry)
    }

    /// Every readable entry, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the entries directory cannot be walked.
    pub fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries: Vec<CacheEntry> = self
            .entry_files()?
            .iter()
            .filter_map(|path| {
                let content = fs::read_to_string(path).ok()?;
                serde_json::from_str(&content).ok()
            })
            .collect();
        entries.sort_by_key(|e| e.key.to_string());
        Ok(entries)
    }

    /// Re-hash every entry's blob.
    ///
    /// Returns one [`CacheError::Corrupt`] per broken entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entries directory cannot be walked.
    pub fn verify(&self) -> Result<Vec<CacheError>, CacheError> {
        let mut problems = Vec::new();
        for path in self.entry_files()? {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str::<CacheEntry>(&c).map_err(|e| e.to_string()));
            match parsed {
                Ok(entry) => {
                    if let Err(e) = self.verified(entry) {
                        problems.push(e);
                    }
                }
                Err(reason) => problems.push(CacheError::Corrupt {
                    key: path.display().to_string(),
                    reason,
                }),
            }
        }
        Ok(problems)
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let dir = self.entries_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "json")
            {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

fn pack_tree(tree: &Path, out: &File) -> Result<(), CacheError> {
    let encoder = zstd::stream::Encoder::new(BufWriter::new(out), COMPRESSION_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", tree)?;
    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    io::Write::flush(&mut writer)?;
    Ok(())
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mash_schema::{ActiveOptions, BuildMode};
    use tempfile::tempdir;

    fn key(name: &str) -> CacheKey {
        CacheKey {
            name: PackageName::new(name),
            version: Version::from("1.0"),
            platform: "macos-14-arm64".to_string(),
            fingerprint: ActiveOptions::new().fingerprint(BuildMode::Stable),
        }
    }

    fn tree(root: &Path) -> PathBuf {
        let dir = root.join("tree");
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/hello"), "#!/bin/sh\necho hi\n").unwrap();
        fs::write(dir.join("README"), "hello").unwrap();
        dir
    }

    #[test]
    fn put_then_get_round_trips_the_tree() {
        let tmp = tempdir().unwrap();
        let cache = BottleCache::new(tmp.path().join("bottles"));
        let k = key("hello");

        assert!(cache.get(&k).is_none());
        let entry = cache.put(&k, &tree(tmp.path())).unwrap();

        let hit = cache.get(&k).unwrap();
        assert_eq!(hit.entry, entry);
        assert!(hit.blob.ends_with(entry.sha256.as_str()));

        let out = tmp.path().join("out");
        hit.unpack(&out).unwrap();
        assert_eq!(fs::read_to_string(out.join("README")).unwrap(), "hello");
        assert!(out.join("bin/hello").is_file());
    }

    #[test]
    fn tampered_blob_is_a_miss_and_reported_by_verify() {
        let tmp = tempdir().unwrap();
        let cache = BottleCache::new(tmp.path().join("bottles"));
        let k = key("hello");
        let entry = cache.put(&k, &tree(tmp.path())).unwrap();

        fs::write(cache.blob_path(&entry.sha256), b"garbage").unwrap();

        assert!(cache.get(&k).is_none());
        assert!(matches!(cache.lookup(&k), Err(CacheError::Corrupt { .. })));
        let problems = cache.verify().unwrap();
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn missing_blob_is_corrupt() {
        let tmp = tempdir().unwrap();
        let cache = BottleCache::new(tmp.path().join("bottles"));
        let k = key("hello");
        let entry = cache.put(&k, &tree(tmp.path())).unwrap();
        fs::remove_file(cache.blob_path(&entry.sha256)).unwrap();

        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn valid_entries_are_immutable_and_corrupt_ones_replaced() {
        let tmp = tempdir().unwrap();
        let cache = BottleCache::new(tmp.path().join("bottles"));
        let k = key("hello");
        let first = cache.put(&k, &tree(tmp.path())).unwrap();

        let other = tmp.path().join("other");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("different"), "x").unwrap();
        let second = cache.put(&k, &other).unwrap();
        assert_eq!(first, second);

        fs::write(cache.blob_path(&first.sha256), b"garbage").unwrap();
        let replaced = cache.put(&k, &other).unwrap();
        assert_ne!(replaced.sha256, first.sha256);
        assert!(cache.get(&k).is_some());
    }

    #[test]
    fn list_is_sorted() {
        let tmp = tempdir().unwrap();
        let cache = BottleCache::new(tmp.path().join("bottles"));
        let t = tree(tmp.path());
        cache.put(&key("zlib"), &t).unwrap();
        cache.put(&key("curl"), &t).unwrap();

        let names: Vec<String> = cache
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.key.name.to_string())
            .collect();
        assert_eq!(names, ["curl", "zlib"]);
    }
}
