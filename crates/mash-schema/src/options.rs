//! Build options and option fingerprints.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Blake3Hash;

/// A build option declared by a formula (`option 'enable-spam', '...'`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDecl {
    /// Option name without leading dashes (`with-qt`, `enable-spam`, `universal`).
    pub name: String,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
    /// Whether the option is on when the user does not mention it.
    #[serde(default)]
    pub default: bool,
}

/// Which source locator a build uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// The primary `[source]` locator.
    #[default]
    Stable,
    /// The `[head]` VCS locator (`--HEAD`).
    Head,
    /// The `[devel]` locator (`--devel`).
    Devel,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::Head => "head",
            Self::Devel => "devel",
        })
    }
}

/// The fully resolved option map of one package build.
///
/// Every declared option has an entry; ordering is by name so that
/// iteration and fingerprints are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveOptions(BTreeMap<String, bool>);

impl ActiveOptions {
    /// Empty option map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option on or off.
    pub fn set(&mut self, name: impl Into<String>, enabled: bool) {
        self.0.insert(name.into(), enabled);
    }

    /// Whether `name` is enabled. Unknown options are off.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }

    /// Whether the option is present in the map at all.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Enabled option names in lexicographic order.
    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.as_str())
    }

    /// All `(name, enabled)` pairs in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(name, on)| (name.as_str(), *on))
    }

    /// Canonical fingerprint of the enabled options and build mode.
    ///
    /// Disabled options do not contribute, so adding a new default-off
    /// option to a formula does not invalidate existing kegs and bottles.
    pub fn fingerprint(&self, mode: BuildMode) -> OptionFingerprint {
        let mut canonical = format!("mode={mode}\n");
        for name in self.enabled() {
            canonical.push_str(name);
            canonical.push('\n');
        }
        OptionFingerprint(Blake3Hash::compute(canonical.as_bytes()))
    }
}

/// Canonical hash of an active option selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionFingerprint(Blake3Hash);

impl OptionFingerprint {
    /// Wrap an existing hex fingerprint (e.g. read back from a receipt).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(Blake3Hash::new(hex))
    }

    /// Full hex form.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// First 16 hex characters, used in keg directory names.
    pub fn short(&self) -> &str {
        let s = self.0.as_str();
        &s[..s.len().min(16)]
    }
}

impl fmt::Display for OptionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_disabled_options() {
        let mut a = ActiveOptions::new();
        a.set("with-qt", true);

        let mut b = a.clone();
        b.set("enable-spam", false);

        assert_eq!(
            a.fingerprint(BuildMode::Stable),
            b.fingerprint(BuildMode::Stable)
        );
    }

    #[test]
    fn fingerprint_depends_on_mode_and_enabled_set() {
        let mut a = ActiveOptions::new();
        a.set("with-qt", true);
        let plain = ActiveOptions::new();

        assert_ne!(
            a.fingerprint(BuildMode::Stable),
            plain.fingerprint(BuildMode::Stable)
        );
        assert_ne!(
            plain.fingerprint(BuildMode::Stable),
            plain.fingerprint(BuildMode::Head)
        );
        assert_eq!(plain.fingerprint(BuildMode::Head).short().len(), 16);
    }
}
