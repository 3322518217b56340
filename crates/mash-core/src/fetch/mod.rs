//! Source acquisition: verified downloads, VCS checkouts and extraction.
//!
//! The executor only talks to the [`Fetcher`] trait, so tests can count or
//! fail fetches without a network.

pub mod download;
pub mod extract;
pub mod vcs;

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mash_schema::{FetchKind, SourceLocator};
use reqwest::Client;

use crate::error::FetchError;
use crate::paths::filename_from_url;

pub use download::download_verified;
pub use extract::{extract_source, strip_components};

/// Something that can obtain sources.
#[async_trait]
pub trait Fetcher: Send + Sync + Debug {
    /// Download a file locator (archive, `nounzip`, remote patch) into
    /// `dir`, verified against its checksum. Returns the file path.
    async fn fetch_file(&self, locator: &SourceLocator, dir: &Path) -> Result<PathBuf, FetchError>;

    /// Check out a VCS locator into `dest`.
    async fn checkout(&self, locator: &SourceLocator, dest: &Path) -> Result<(), FetchError>;
}

/// The production fetcher: HTTP(S) and `file://` downloads with a
/// checksum-keyed download cache, plus VCS tools.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: Client,
    cache_dir: PathBuf,
}

impl SourceFetcher {
    /// Fetcher caching verified downloads in `cache_dir`.
    pub fn new(client: Client, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
        }
    }

    fn cache_path(&self, locator: &SourceLocator) -> Option<PathBuf> {
        let checksum = locator.checksum.as_ref()?;
        let filename = filename_from_url(&locator.url);
        Some(self.cache_dir.join(format!("{}-{filename}", checksum.as_str())))
    }

    /// Copy a cached download into `dest` if it is still intact.
    async fn from_cache(&self, locator: &SourceLocator, dest: &Path) -> Option<()> {
        let cached = self.cache_path(locator)?;
        let checksum = locator.checksum.as_ref()?;
        let actual = download::sha256_file(&cached).await.ok()?;
        if !checksum.matches(&actual) {
            tracing::warn!(path = %cached.display(), "cached download is corrupt, refetching");
            tokio::fs::remove_file(&cached).await.ok();
            return None;
        }
        tokio::fs::copy(&cached, dest).await.ok()?;
        tracing::debug!(url = %locator.url, "download cache hit");
        Some(())
    }

    async fn store_in_cache(&self, locator: &SourceLocator, file: &Path) {
        let Some(cached) = self.cache_path(locator) else {
            return;
        };
        let result = async {
            tokio::fs::create_dir_all(&self.cache_dir).await?;
            let partial = cached.with_extension("part");
            tokio::fs::copy(file, &partial).await?;
            tokio::fs::rename(&partial, &cached).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to cache download");
        }
    }
}

#[async_trait]
impl Fetcher for SourceFetcher {
    async fn fetch_file(&self, locator: &SourceLocator, dir: &Path) -> Result<PathBuf, FetchError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(FetchError::io("create download directory"))?;
        let dest = dir.join(filename_from_url(&locator.url));

        if self.from_cache(locator, &dest).await.is_some() {
            return Ok(dest);
        }

        let mut last_error = None;
        for url in locator.urls() {
            match download_verified(&self.client, url, &dest, locator.checksum.as_ref()).await {
                Ok(_) => {
                    self.store_in_cache(locator, &dest).await;
                    return Ok(dest);
                }
                // Only transport failures fall through to the next mirror
                Err(e @ FetchError::Network { .. }) => {
                    tracing::warn!(url, error = %e, "download failed, trying next mirror");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::Network {
            url: locator.url.clone(),
            reason: "no URL to fetch".to_string(),
        }))
    }

    async fn checkout(&self, locator: &SourceLocator, dest: &Path) -> Result<(), FetchError> {
        vcs::checkout(locator, dest).await
    }
}

/// Materialize `locator` as a source tree at `dest`.
///
/// Archives are downloaded into `download_dir`, verified and extracted with
/// a single top-level directory stripped; `nounzip` files are copied in as
/// they are; VCS locators are checked out.
///
/// # Errors
///
/// Propagates fetch, verification and extraction failures.
pub async fn fetch_tree(
    fetcher: &dyn Fetcher,
    locator: &SourceLocator,
    download_dir: &Path,
    dest: &Path,
) -> Result<(), FetchError> {
    match locator.kind {
        kind if kind.is_vcs() => {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(FetchError::io("create checkout parent"))?;
            }
            // Checkout tools want to create the directory themselves
            tokio::fs::remove_dir(dest).await.ok();
            fetcher.checkout(locator, dest).await
        }
        FetchKind::NoUnzip => {
            let file = fetcher.fetch_file(locator, download_dir).await?;
            tokio::fs::create_dir_all(dest)
                .await
                .map_err(FetchError::io("create source directory"))?;
            let name = file.file_name().map(PathBuf::from).unwrap_or_default();
            tokio::fs::copy(&file, dest.join(name))
                .await
                .map_err(FetchError::io("copy source file"))?;
            Ok(())
        }
        _ => {
            let file = fetcher.fetch_file(locator, download_dir).await?;
            let target = dest.to_path_buf();
            tokio::task::spawn_blocking(move || extract_source(&file, &target))
                .await
                .map_err(|e| FetchError::Extract {
                    path: dest.to_path_buf(),
                    reason: e.to_string(),
                })?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mash_schema::Sha256Digest;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    fn archive_locator(url: String, body: &[u8]) -> SourceLocator {
        SourceLocator {
            url,
            kind: FetchKind::NoUnzip,
            checksum: Some(Sha256Digest::new(hex::encode(Sha256::digest(body))).unwrap()),
            mirrors: Vec::new(),
            tag: None,
            branch: None,
            revision: None,
            unverified: false,
        }
    }

    #[tokio::test]
    async fn mirrors_are_tried_after_network_failures() {
        let mut server = mockito::Server::new_async().await;
        let _down = server
            .mock("GET", "/primary/tool-1.0.bin")
            .with_status(503)
            .create_async()
            .await;
        let _mirror = server
            .mock("GET", "/mirror/tool-1.0.bin")
            .with_status(200)
            .with_body("payload")
            .create_async()
            .await;

        let tmp = tempdir().unwrap();
        let mut locator = archive_locator(format!("{}/primary/tool-1.0.bin", server.url()), b"payload");
        locator.mirrors = vec![format!("{}/mirror/tool-1.0.bin", server.url())];

        let fetcher = SourceFetcher::new(Client::new(), tmp.path().join("cache"));
        let file = fetcher
            .fetch_file(&locator, &tmp.path().join("dl"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(file).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn checksum_mismatch_does_not_fall_back_to_mirrors() {
        let mut server = mockito::Server::new_async().await;
        let _bad = server
            .mock("GET", "/primary/tool-1.0.bin")
            .with_status(200)
            .with_body("tampered")
            .create_async()
            .await;
        let mirror = server
            .mock("GET", "/mirror/tool-1.0.bin")
            .with_status(200)
            .with_body("payload")
            .expect(0)
            .create_async()
            .await;

        let tmp = tempdir().unwrap();
        let mut locator = archive_locator(format!("{}/primary/tool-1.0.bin", server.url()), b"payload");
        locator.mirrors = vec![format!("{}/mirror/tool-1.0.bin", server.url())];

        let fetcher = SourceFetcher::new(Client::new(), tmp.path().join("cache"));
        let err = fetcher
            .fetch_file(&locator, &tmp.path().join("dl"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
        mirror.assert_async().await;
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tool-1.0.bin")
            .with_status(200)
            .with_body("payload")
            .expect(1)
            .create_async()
            .await;

        let tmp = tempdir().unwrap();
        let locator = archive_locator(format!("{}/tool-1.0.bin", server.url()), b"payload");
        let fetcher = SourceFetcher::new(Client::new(), tmp.path().join("cache"));

        fetcher.fetch_file(&locator, &tmp.path().join("a")).await.unwrap();
        let again = fetcher.fetch_file(&locator, &tmp.path().join("b")).await.unwrap();
        assert_eq!(std::fs::read(again).unwrap(), b"payload");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn nounzip_tree_keeps_the_file() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("script.sh");
        std::fs::write(&source, b"#!/bin/sh\n").unwrap();
        let locator = archive_locator(format!("file://{}", source.display()), b"#!/bin/sh\n");

        let fetcher = SourceFetcher::new(Client::new(), tmp.path().join("cache"));
        let dest = tmp.path().join("src");
        fetch_tree(&fetcher, &locator, &tmp.path().join("dl"), &dest)
            .await
            .unwrap();
        assert!(dest.join("script.sh").is_file());
    }
}
