//! Version detection from source URLs.
//!
//! Most formulae do not spell out a version: it is implied by the archive
//! name (`archive-1.2.3.tar.bz2`). Detection only looks at the final path
//! segment of the URL.

use std::sync::OnceLock;

use regex::Regex;

use crate::Version;

const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.gz", ".tgz", ".tar.bz2", ".tbz", ".tbz2", ".tar.xz", ".txz", ".tar.zst", ".tzst",
    ".tar", ".zip", ".gz", ".bz2", ".xz",
];

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"v?(\d+(?:\.\d+)*(?:[-.]?(?:alpha|beta|rc|pre|final|b)\d*)?[a-z]?)$")
            .unwrap_or_else(|e| unreachable!("static version regex is valid: {e}"))
    })
}

/// Guess the version embedded in a source URL's file name.
///
/// Returns `None` when the file name carries no recognisable version.
pub fn detect_version(url: &str) -> Option<Version> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let mut stem = path.trim_end_matches('/').rsplit('/').next()?.to_string();

    let lower = stem.to_lowercase();
    if let Some(suffix) = ARCHIVE_SUFFIXES.iter().find(|s| lower.ends_with(*s)) {
        stem.truncate(stem.len() - suffix.len());
    }

    version_regex()
        .captures(&stem)
        .and_then(|caps| caps.get(1))
        .map(|m| Version::from(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_archive_versions() {
        let cases = [
            (
                "https://example.com/archive-1.2.3.tar.bz2",
                Some("1.2.3"),
            ),
            (
                "ftp://ftp.kde.org/pub/kde/stable/4.7.4/src/kde-baseapps-4.7.4.tar.bz2",
                Some("4.7.4"),
            ),
            ("https://example.com/archive-2.0-beta.tar.gz", Some("2.0-beta")),
            ("https://github.com/o/r/archive/v1.10.0.tar.gz", Some("1.10.0")),
            ("https://example.com/openssl-1.0.1e.tar.gz", Some("1.0.1e")),
            ("https://example.com/foo.tar.gz", None),
        ];

        for (url, expected) in cases {
            assert_eq!(
                detect_version(url).as_ref().map(Version::as_str),
                expected,
                "{url}"
            );
        }
    }
}
