//! Archive extraction.
//!
//! gzip, zstd, plain tar and zip are handled natively. bzip2 and xz tarballs
//! go through the system `tar`, invoked with an argv vector.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use zip::ZipArchive;
use zstd::stream::Decoder as ZstdDecoder;

use crate::error::FetchError;

/// Archive formats recognised by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `.tar.gz`, `.tgz`
    TarGz,
    /// `.tar.zst`, `.tzst`
    TarZst,
    /// `.tar.bz2`, `.tbz`, `.tbz2`
    TarBz2,
    /// `.tar.xz`, `.txz`
    TarXz,
    /// `.tar`
    Tar,
    /// `.zip`
    Zip,
    /// Anything else: copied as is.
    Plain,
}

/// Detect archive format from file extension
pub fn detect_format(path: &Path) -> ArchiveFormat {
    let name = path.to_string_lossy().to_lowercase();
    let ends = |suffixes: &[&str]| suffixes.iter().any(|s| name.ends_with(s));

    if ends(&[".tar.gz", ".tgz"]) {
        ArchiveFormat::TarGz
    } else if ends(&[".tar.zst", ".tzst"]) {
        ArchiveFormat::TarZst
    } else if ends(&[".tar.bz2", ".tbz", ".tbz2"]) {
        ArchiveFormat::TarBz2
    } else if ends(&[".tar.xz", ".txz"]) {
        ArchiveFormat::TarXz
    } else if ends(&[".tar"]) {
        ArchiveFormat::Tar
    } else if ends(&[".zip"]) {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::Plain
    }
}

/// Extract `archive` into `dest_dir`, then strip a single top-level directory.
///
/// # Errors
///
/// Returns [`FetchError::Extract`] for malformed archives or entries that
/// would escape `dest_dir`, and [`FetchError::Io`] for filesystem failures.
pub fn extract_source(archive: &Path, dest_dir: &Path) -> Result<(), FetchError> {
    let fail = |reason: String| FetchError::Extract {
        path: archive.to_path_buf(),
        reason,
    };
    fs::create_dir_all(dest_dir).map_err(FetchError::io("create source directory"))?;

    let format = detect_format(archive);
    tracing::debug!(archive = %archive.display(), ?format, "extracting");

    match format {
        ArchiveFormat::TarGz => {
            let file = open(archive)?;
            extract_tar(flate2::read::GzDecoder::new(BufReader::new(file)), dest_dir)
                .map_err(fail)?;
        }
        ArchiveFormat::TarZst => {
            let file = open(archive)?;
            let decoder = ZstdDecoder::new(BufReader::new(file)).map_err(|e| fail(e.to_string()))?;
            extract_tar(decoder, dest_dir).map_err(fail)?;
        }
        ArchiveFormat::Tar => {
            let file = open(archive)?;
            extract_tar(BufReader::new(file), dest_dir).map_err(fail)?;
        }
        ArchiveFormat::Zip => extract_zip(archive, dest_dir).map_err(fail)?,
        ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => system_tar(archive, dest_dir).map_err(fail)?,
        ArchiveFormat::Plain => {
            let filename = archive
                .file_name()
                .ok_or_else(|| fail("invalid filename".to_string()))?;
            fs::copy(archive, dest_dir.join(filename)).map_err(FetchError::io("copy source file"))?;
            return Ok(());
        }
    }

    strip_components(dest_dir).map_err(FetchError::io("strip top-level directory"))
}

fn open(path: &Path) -> Result<File, FetchError> {
    File::open(path).map_err(FetchError::io(format!("open {}", path.display())))
}

/// Entry path relative to the extraction root, or `None` when it would escape it.
fn contained(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Extract a tar archive from a reader
fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> Result<(), String> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let entry_path = entry.path().map_err(|e| e.to_string())?.into_owned();

        // Sanitize path to prevent Zip Slip
        let relative_path = contained(&entry_path)
            .ok_or_else(|| format!("invalid path in archive: {}", entry_path.display()))?;
        if relative_path.as_os_str().is_empty() {
            continue;
        }
        let absolute_path = dest_dir.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        entry
            .unpack(&absolute_path)
            .map_err(|e| format!("{}: {e}", relative_path.display()))?;
    }
    Ok(())
}

/// Extract a zip archive
fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), String> {
    let file = File::open(archive_path).map_err(|e| e.to_string())?;
    let mut archive = ZipArchive::new(file).map_err(|e| e.to_string())?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| e.to_string())?;
        let Some(relative_path) = file.enclosed_name() else {
            return Err(format!("invalid path in archive: {}", file.name()));
        };

        let absolute_path = dest_dir.join(&relative_path);
        if file.is_dir() {
            fs::create_dir_all(&absolute_path).map_err(|e| e.to_string())?;
            continue;
        }
        if let Some(p) = absolute_path.parent() {
            fs::create_dir_all(p).map_err(|e| e.to_string())?;
        }

        let mut outfile = File::create(&absolute_path).map_err(|e| e.to_string())?;
        io::copy(&mut file, &mut outfile).map_err(|e| e.to_string())?;

        set_mode(&absolute_path, file.unix_mode()).map_err(|e| e.to_string())?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_mode(_: &Path, _: Option<u32>) -> io::Result<()> {
    Ok(())
}

fn system_tar(archive: &Path, dest_dir: &Path) -> Result<(), String> {
    let output = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest_dir)
        .output()
        .map_err(|e| format!("failed to spawn tar: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Detect if a directory has a single top-level directory and strip it by moving contents up.
pub fn strip_components(dir: &Path) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(Result::ok).collect();

    // Filter out hidden files (like .DS_Store)
    entries.retain(|e| !e.file_name().to_string_lossy().starts_with('.'));

    // If there is exactly one entry and it's a directory, move its contents up
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        let top_level = entries[0].path();
        let sub_entries: Vec<_> = fs::read_dir(&top_level)?.filter_map(Result::ok).collect();

        for entry in sub_entries {
            let target = dir.join(entry.file_name());
            fs::rename(entry.path(), target)?;
        }

        fs::remove_dir(top_level)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tarball(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn detects_formats_case_insensitively() {
        assert_eq!(detect_format(Path::new("x-1.0.tar.gz")), ArchiveFormat::TarGz);
        assert_eq!(detect_format(Path::new("X.TGZ")), ArchiveFormat::TarGz);
        assert_eq!(detect_format(Path::new("x.tar.bz2")), ArchiveFormat::TarBz2);
        assert_eq!(detect_format(Path::new("x.tar.zst")), ArchiveFormat::TarZst);
        assert_eq!(detect_format(Path::new("x.zip")), ArchiveFormat::Zip);
        assert_eq!(detect_format(Path::new("x.patch")), ArchiveFormat::Plain);
    }

    #[test]
    fn extracts_and_strips_single_top_level_dir() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("hello-1.0.tar.gz");
        tarball(
            &archive,
            &[("hello-1.0/configure", "#!/bin/sh\n"), ("hello-1.0/src/main.c", "int main;")],
        );

        let dest = tmp.path().join("src");
        extract_source(&archive, &dest).unwrap();
        assert!(dest.join("configure").is_file());
        assert!(dest.join("src/main.c").is_file());
        assert!(!dest.join("hello-1.0").exists());
    }

    #[test]
    fn plain_files_are_copied() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("fix.patch");
        fs::write(&file, "--- a\n+++ b\n").unwrap();
        let dest = tmp.path().join("out");
        extract_source(&file, &dest).unwrap();
        assert!(dest.join("fix.patch").is_file());
    }

    #[test]
    fn rejects_escaping_entries() {
        assert!(contained(Path::new("../etc/passwd")).is_none());
        assert!(contained(Path::new("/etc/passwd")).is_none());
        assert_eq!(
            contained(Path::new("./a/b")),
            Some(PathBuf::from("a/b"))
        );
    }
}
