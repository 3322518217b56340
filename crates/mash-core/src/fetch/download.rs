//! Verified downloads.
//!
//! Bytes are hashed while they are written, so a file on disk that survives
//! this module always matches its declared checksum.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use mash_schema::Sha256Digest;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FetchError;

const READ_BUFFER: usize = 64 * 1024;

/// Local path of a `file://` URL.
pub(crate) fn file_url_path(url: &str) -> Option<PathBuf> {
    if !url.starts_with("file://") {
        return None;
    }
    reqwest::Url::parse(url).ok()?.to_file_path().ok()
}

/// Download `url` into `dest` with streaming SHA-256 verification.
///
/// `expected` is `None` only for locators marked `unverified`. Returns the
/// hex digest of the written bytes.
///
/// # Errors
///
/// [`FetchError::Network`] for transport failures and non-success statuses,
/// [`FetchError::ChecksumMismatch`] when the digest differs (the partial
/// file is removed), [`FetchError::Io`] for local write failures.
pub async fn download_verified(
    client: &Client,
    url: &str,
    dest: &Path,
    expected: Option<&Sha256Digest>,
) -> Result<String, FetchError> {
    tracing::debug!(url, dest = %dest.display(), "downloading");

    let actual = match file_url_path(url) {
        Some(source) => copy_hashed(&source, dest).await?,
        None => stream_hashed(client, url, dest).await?,
    };

    if let Some(expected) = expected
        && !expected.matches(&actual)
    {
        tokio::fs::remove_file(dest).await.ok();
        return Err(FetchError::ChecksumMismatch {
            url: url.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }

    Ok(actual)
}

async fn stream_hashed(client: &Client, url: &str, dest: &Path) -> Result<String, FetchError> {
    let network = |e: reqwest::Error| FetchError::Network {
        url: url.to_string(),
        reason: e.to_string(),
    };

    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(network)?;

    let mut file = File::create(dest)
        .await
        .map_err(FetchError::io(format!("create {}", dest.display())))?;
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                tokio::fs::remove_file(dest).await.ok();
                return Err(network(e));
            }
        };
        file.write_all(&chunk)
            .await
            .map_err(FetchError::io("write download"))?;
        hasher.update(&chunk);
    }

    file.flush().await.map_err(FetchError::io("flush download"))?;
    Ok(hex::encode(hasher.finalize()))
}

async fn copy_hashed(source: &Path, dest: &Path) -> Result<String, FetchError> {
    let mut input = File::open(source).await.map_err(|e| FetchError::Network {
        url: format!("file://{}", source.display()),
        reason: e.to_string(),
    })?;
    let mut output = File::create(dest)
        .await
        .map_err(FetchError::io(format!("create {}", dest.display())))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = input
            .read(&mut buffer)
            .await
            .map_err(FetchError::io(format!("read {}", source.display())))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buffer[..n])
            .await
            .map_err(FetchError::io("write download"))?;
        hasher.update(&buffer[..n]);
    }

    output.flush().await.map_err(FetchError::io("flush download"))?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a file already on disk.
pub(crate) async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut input = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = input.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
