//! Host environment detection.
//!
//! Resolution only ever sees an explicit [`Environment`]; this module builds
//! one describing the running machine. Everything here shells out with
//! argv vectors and treats failures as "unknown" rather than errors.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use mash_schema::{Arch, Compiler, CompilerKind, Environment, Os, Version};
use regex::Regex;

/// Tools probed on `PATH`. The key is the name formulae use in requirements.
const PROBED_TOOLS: &[(&str, &str)] = &[
    ("git", "git"),
    ("hg", "hg"),
    ("svn", "svn"),
    ("bzr", "bzr"),
    ("cvs", "cvs"),
    ("patch", "patch"),
    ("make", "make"),
    ("cmake", "cmake"),
    ("autoconf", "autoconf"),
    ("pkg-config", "pkg-config"),
    ("fortran", "gfortran"),
    ("python", "python3"),
];

/// Describe the running host.
pub fn detect() -> Environment {
    let os = Os::current();
    let env = Environment {
        os,
        os_version: os_version(os),
        arch: Arch::current(),
        compiler: compiler(),
        tools: tools(),
    };
    tracing::debug!(
        platform = %env.platform_tag(),
        compiler = %env.compiler.kind,
        tools = ?env.tools,
        "detected host environment"
    );
    env
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn os_version(os: Os) -> Version {
    let raw = match os {
        Os::MacOs => command_output("sw_vers", &["-productVersion"]),
        Os::Linux => command_output("uname", &["-r"]),
    };
    // Kernel releases carry suffixes (`6.8.0-45-generic`); keep the numeric head
    let numeric = raw.as_deref().and_then(|s| {
        let head: String = s
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let head = head.trim_end_matches('.').to_string();
        (!head.is_empty()).then_some(head)
    });
    Version::from(numeric.unwrap_or_else(|| "0".to_string()))
}

fn compiler() -> Compiler {
    let kind = if which::which("clang").is_ok() || cfg!(target_os = "macos") {
        CompilerKind::Clang
    } else {
        CompilerKind::Gcc
    };
    let build = match kind {
        CompilerKind::Clang => command_output("clang", &["--version"])
            .as_deref()
            .and_then(apple_clang_build),
        _ => None,
    };
    Compiler { kind, build }
}

/// Apple clang reports its build as `clang-1500.3.9.4`.
fn apple_clang_build(version_output: &str) -> Option<u32> {
    let re = Regex::new(r"clang-(\d+)").ok()?;
    re.captures(version_output)?.get(1)?.as_str().parse().ok()
}

fn tools() -> BTreeSet<String> {
    let mut found: BTreeSet<String> = PROBED_TOOLS
        .iter()
        .filter(|(_, binary)| which::which(binary).is_ok())
        .map(|(name, _)| (*name).to_string())
        .collect();

    if Path::new("/Library/Developer/CommandLineTools/usr/bin").is_dir() {
        found.insert("clt".to_string());
    }
    if command_output("xcode-select", &["-p"]).is_some_and(|p| p.contains("Xcode.app")) {
        found.insert("xcode".to_string());
    }
    if Path::new("/opt/X11").is_dir() || Path::new("/usr/include/X11").is_dir() {
        found.insert("x11".to_string());
    }
    found
}

#[cfg(test)]
pub(crate) fn test_environment() -> Environment {
    Environment {
        os: Os::MacOs,
        os_version: Version::from("14.2"),
        arch: Arch::Arm64,
        compiler: Compiler {
            kind: CompilerKind::Clang,
            build: Some(1500),
        },
        tools: ["git", "patch", "make"]
            .into_iter()
            .map(String::from)
            .collect(),
    }
}
