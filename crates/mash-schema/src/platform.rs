//! Target environment model and platform predicates.
//!
//! The resolver never inspects the host directly: it checks formula
//! requirements against an explicit [`Environment`] value. Host detection
//! lives in `mash-core`; tests construct environments by hand.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Arch, Version};

/// Operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// macOS
    #[serde(alias = "darwin")]
    MacOs,
    /// Linux
    Linux,
}

impl Os {
    /// OS of the running process.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    /// Lowercase name used in platform tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MacOs => "macos",
            Self::Linux => "linux",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Os {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "macos" | "darwin" | "osx" => Ok(Self::MacOs),
            "linux" => Ok(Self::Linux),
            _ => Err(format!("Unknown operating system: {s}")),
        }
    }
}

/// Compiler family, as used by `fails_with` and `compiler:` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompilerKind {
    /// LLVM clang
    Clang,
    /// GNU gcc
    Gcc,
    /// Apple's llvm-gcc hybrid
    LlvmGcc,
}

impl CompilerKind {
    /// C compiler driver name.
    pub fn cc(&self) -> &'static str {
        match self {
            Self::Clang => "clang",
            Self::Gcc => "gcc",
            Self::LlvmGcc => "llvm-gcc",
        }
    }

    /// C++ compiler driver name.
    pub fn cxx(&self) -> &'static str {
        match self {
            Self::Clang => "clang++",
            Self::Gcc => "g++",
            Self::LlvmGcc => "llvm-g++",
        }
    }
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cc())
    }
}

impl FromStr for CompilerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clang" => Ok(Self::Clang),
            "gcc" => Ok(Self::Gcc),
            "llvm" | "llvm-gcc" | "llvm_gcc" => Ok(Self::LlvmGcc),
            _ => Err(format!("Unknown compiler: {s}")),
        }
    }
}

/// The compiler a build will use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compiler {
    /// Compiler family.
    pub kind: CompilerKind,
    /// Vendor build number when known (e.g. Apple clang build 1500).
    #[serde(default)]
    pub build: Option<u32>,
}

/// The declared target environment a plan is resolved and built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Operating system family.
    pub os: Os,
    /// Operating system version (`14.2`, kernel release on Linux).
    pub os_version: Version,
    /// Target architecture.
    pub arch: Arch,
    /// Compiler used for builds.
    pub compiler: Compiler,
    /// Host tools known to be available (`xcode`, `clt`, `fortran`, `git`, ...).
    #[serde(default)]
    pub tools: BTreeSet<String>,
}

impl Environment {
    /// Platform tag used as part of every bottle key (`arm64_macos-14`).
    ///
    /// Only the major OS version is included: bottles are ABI compatible
    /// across minor releases.
    pub fn platform_tag(&self) -> String {
        let major = self
            .os_version
            .as_str()
            .split('.')
            .next()
            .unwrap_or_default();
        format!("{}_{}-{major}", self.arch, self.os)
    }

    /// Whether a named host tool is available.
    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_tag_uses_major_version() {
        let env = Environment {
            os: Os::MacOs,
            os_version: Version::from("14.2.1"),
            arch: Arch::Arm64,
            compiler: Compiler {
                kind: CompilerKind::Clang,
                build: None,
            },
            tools: BTreeSet::new(),
        };
        assert_eq!(env.platform_tag(), "arm64_macos-14");
    }

    #[test]
    fn compiler_aliases() {
        assert_eq!("llvm".parse::<CompilerKind>().unwrap(), CompilerKind::LlvmGcc);
        assert_eq!(CompilerKind::Gcc.cxx(), "g++");
    }
}
