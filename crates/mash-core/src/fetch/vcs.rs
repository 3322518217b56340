//! Version control checkouts.
//!
//! Each backend is a fixed argv vector; URLs and refs from formulae are
//! passed as separate arguments and never reach a shell.

use std::path::Path;

use mash_schema::{FetchKind, SourceLocator};
use tokio::process::Command;

use crate::error::FetchError;

/// Check out `locator` into `dest`, which must not exist yet.
///
/// # Errors
///
/// Returns [`FetchError::Vcs`] when the tool is missing or exits non-zero.
pub async fn checkout(locator: &SourceLocator, dest: &Path) -> Result<(), FetchError> {
    let url = locator.url.as_str();
    let dest_arg = dest.to_string_lossy().into_owned();

    match locator.kind {
        FetchKind::Git => {
            let url = url.strip_prefix("git+").unwrap_or(url);
            let mut clone = vec!["clone", "--quiet"];
            let pinned_ref = locator.tag.as_deref().or(locator.branch.as_deref());
            if let Some(reference) = pinned_ref
                && locator.revision.is_none()
            {
                clone.extend(["--depth", "1", "--branch", reference]);
            }
            clone.extend([url, dest_arg.as_str()]);
            run("git", url, &clone, None).await?;

            if let Some(revision) = &locator.revision {
                run(
                    "git",
                    url,
                    &["checkout", "--quiet", revision.as_str()],
                    Some(dest),
                )
                .await?;
            }
        }
        FetchKind::Hg => {
            let url = url
                .strip_prefix("hg://")
                .map_or_else(|| url.to_string(), |rest| format!("https://{rest}"));
            let mut args = vec!["clone".to_string()];
            if let Some(reference) = pinned(locator) {
                args.extend(["-r".to_string(), reference.to_string()]);
            }
            args.extend([url.clone(), dest_arg.clone()]);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run("hg", &url, &args, None).await?;
        }
        FetchKind::Svn => {
            let url = url.strip_prefix("svn+").unwrap_or(url);
            let mut args = vec!["checkout", "--quiet", "--non-interactive"];
            if let Some(revision) = locator.revision.as_deref() {
                args.extend(["-r", revision]);
            }
            args.extend([url, dest_arg.as_str()]);
            run("svn", url, &args, None).await?;
        }
        FetchKind::Bzr => {
            let url = url.strip_prefix("bzr://").unwrap_or(url);
            let mut args = vec!["branch"];
            if let Some(revision) = locator.revision.as_deref() {
                args.extend(["-r", revision]);
            }
            args.extend([url, dest_arg.as_str()]);
            run("bzr", url, &args, None).await?;
        }
        FetchKind::Cvs => {
            // `cvs://<root>:<module>`
            let spec = url.strip_prefix("cvs://").unwrap_or(url);
            let (root, module) = spec.rsplit_once(':').ok_or_else(|| FetchError::Vcs {
                tool: "cvs",
                url: url.to_string(),
                reason: "expected cvs://<root>:<module>".to_string(),
            })?;
            let mut args = vec!["-Q", "-d", root, "checkout"];
            if let Some(reference) = pinned(locator) {
                args.extend(["-r", reference]);
            }
            args.extend(["-d", dest_arg.as_str(), module]);
            run("cvs", url, &args, None).await?;
        }
        FetchKind::Archive | FetchKind::NoUnzip => {
            return Err(FetchError::Vcs {
                tool: "vcs",
                url: url.to_string(),
                reason: "not a version control locator".to_string(),
            });
        }
    }

    Ok(())
}

/// The most specific ref a locator pins: revision, then tag, then branch.
fn pinned(locator: &SourceLocator) -> Option<&str> {
    locator
        .revision
        .as_deref()
        .or(locator.tag.as_deref())
        .or(locator.branch.as_deref())
}

async fn run(
    tool: &'static str,
    url: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<(), FetchError> {
    let program = which::which(tool).map_err(|_| FetchError::Vcs {
        tool,
        url: url.to_string(),
        reason: format!("{tool} is not installed"),
    })?;

    tracing::debug!(tool, ?args, "vcs");
    let mut command = Command::new(program);
    command
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = command.output().await.map_err(|e| FetchError::Vcs {
        tool,
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(FetchError::Vcs {
            tool,
            url: url.to_string(),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(kind: FetchKind) -> SourceLocator {
        SourceLocator {
            url: "https://example.com/repo".to_string(),
            kind,
            checksum: None,
            mirrors: Vec::new(),
            tag: Some("v1.0".to_string()),
            branch: Some("main".to_string()),
            revision: None,
            unverified: false,
        }
    }

    #[test]
    fn pinned_prefers_revision() {
        let mut loc = locator(FetchKind::Hg);
        assert_eq!(pinned(&loc), Some("v1.0"));
        loc.revision = Some("abc123".to_string());
        assert_eq!(pinned(&loc), Some("abc123"));
    }

    #[tokio::test]
    async fn archive_locators_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = checkout(&locator(FetchKind::Archive), &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Vcs { .. }));
    }

    #[tokio::test]
    async fn git_checkout_of_local_repository() {
        if which::which("git").is_err() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(&repo)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .status()
                .unwrap();
            assert!(status.success());
        };
        git(&["init", "--quiet"]);
        std::fs::write(repo.join("README"), "hi").unwrap();
        git(&["add", "README"]);
        git(&["commit", "--quiet", "-m", "init"]);
        git(&["tag", "v1.0"]);

        let loc = SourceLocator {
            url: format!("file://{}", repo.display()),
            kind: FetchKind::Git,
            branch: None,
            ..locator(FetchKind::Git)
        };
        let dest = tmp.path().join("checkout");
        checkout(&loc, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("README")).unwrap(), "hi");
    }
}
