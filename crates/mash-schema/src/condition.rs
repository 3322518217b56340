//! Conditions attached to dependencies, requirements, patches and steps.
//!
//! A condition is a conjunction of (optionally negated) predicates:
//!
//! ```text
//! with:qt && !head && os>=10.9
//! ```
//!
//! It is evaluated against the owning formula's own [`ActiveOptions`], its
//! [`BuildMode`] and the declared target [`Environment`]. There is no access
//! to other packages' state, which keeps resolution deterministic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ActiveOptions, Arch, BuildMode, CompilerKind, Environment, Os, Version};

/// Inputs a condition may look at.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Active options of the formula that owns the condition.
    pub options: &'a ActiveOptions,
    /// Build mode of that formula.
    pub mode: BuildMode,
    /// Declared target environment.
    pub env: &'a Environment,
}

/// A single test inside a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Named option is enabled (`with:x` is sugar for `option:with-x`).
    Option(String),
    /// Building from the head locator.
    Head,
    /// Building from the devel locator.
    Devel,
    /// Building from the stable locator.
    Stable,
    /// Target architecture matches.
    Arch(Arch),
    /// Target OS family matches.
    Os(Os),
    /// Target OS version is at least this.
    OsAtLeast(Version),
    /// Target OS version is below this.
    OsBelow(Version),
    /// Build compiler family matches.
    Compiler(CompilerKind),
}

impl Predicate {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Self::Option(name) => ctx.options.is_enabled(name),
            Self::Head => ctx.mode == BuildMode::Head,
            Self::Devel => ctx.mode == BuildMode::Devel,
            Self::Stable => ctx.mode == BuildMode::Stable,
            Self::Arch(arch) => ctx.env.arch == *arch,
            Self::Os(os) => ctx.env.os == *os,
            Self::OsAtLeast(v) => ctx.env.os_version >= *v,
            Self::OsBelow(v) => ctx.env.os_version < *v,
            Self::Compiler(kind) => ctx.env.compiler.kind == *kind,
        }
    }
}

/// A possibly negated predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    /// `true` when written with a leading `!`.
    pub negated: bool,
    /// The underlying test.
    pub predicate: Predicate,
}

/// A parsed condition: all atoms must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    atoms: Vec<Atom>,
    source: String,
}

impl Condition {
    /// Evaluate the conjunction.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        self.atoms
            .iter()
            .all(|atom| atom.predicate.evaluate(ctx) != atom.negated)
    }

    /// The parsed atoms.
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// Option names this condition reads.
    pub fn referenced_options(&self) -> impl Iterator<Item = &str> {
        self.atoms.iter().filter_map(|atom| match &atom.predicate {
            Predicate::Option(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Evaluate an optional condition; a missing condition is always true.
pub fn holds(condition: Option<&Condition>, ctx: &EvalContext<'_>) -> bool {
    condition.is_none_or(|c| c.evaluate(ctx))
}

fn parse_predicate(text: &str) -> Result<Predicate, String> {
    if let Some(rest) = text.strip_prefix("os>=") {
        return Ok(Predicate::OsAtLeast(Version::from(rest.trim())));
    }
    if let Some(rest) = text.strip_prefix("os<") {
        return Ok(Predicate::OsBelow(Version::from(rest.trim())));
    }

    let (key, value) = match text.split_once(':') {
        Some((k, v)) => (k.trim(), Some(v.trim())),
        None => (text, None),
    };

    match (key, value) {
        ("head", None) => Ok(Predicate::Head),
        ("devel", None) => Ok(Predicate::Devel),
        ("stable", None) => Ok(Predicate::Stable),
        ("universal", None) => Ok(Predicate::Option("universal".to_string())),
        ("with", Some(v)) if !v.is_empty() => Ok(Predicate::Option(format!("with-{v}"))),
        ("option", Some(v)) if !v.is_empty() => Ok(Predicate::Option(v.to_string())),
        ("arch", Some(v)) => v.parse().map(Predicate::Arch),
        ("os", Some(v)) => v.parse().map(Predicate::Os),
        ("compiler", Some(v)) => v.parse().map(Predicate::Compiler),
        _ => Err(format!("unknown predicate '{text}'")),
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut atoms = Vec::new();
        for part in s.split("&&") {
            let part = part.trim();
            if part.is_empty() {
                return Err(format!("empty term in condition '{s}'"));
            }

            // `without:x` is the negation of `with:x`
            let (negated, body) = match part.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, part),
            };
            let (negated, body) = match body.strip_prefix("without:") {
                Some(rest) => (!negated, format!("with:{rest}")),
                None => (negated, body.to_string()),
            };

            atoms.push(Atom {
                negated,
                predicate: parse_predicate(&body)?,
            });
        }

        Ok(Self {
            atoms,
            source: s.trim().to_string(),
        })
    }
}

impl TryFrom<String> for Condition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Compiler;
    use std::collections::BTreeSet;

    fn env() -> Environment {
        Environment {
            os: Os::MacOs,
            os_version: Version::from("10.9"),
            arch: Arch::X86_64,
            compiler: Compiler {
                kind: CompilerKind::Clang,
                build: Some(500),
            },
            tools: BTreeSet::new(),
        }
    }

    #[test]
    fn with_and_without_are_complements() {
        let mut options = ActiveOptions::new();
        options.set("with-qt", true);
        let env = env();
        let ctx = EvalContext {
            options: &options,
            mode: BuildMode::Stable,
            env: &env,
        };

        assert!("with:qt".parse::<Condition>().unwrap().evaluate(&ctx));
        assert!(!"without:qt".parse::<Condition>().unwrap().evaluate(&ctx));
        assert!("!without:qt".parse::<Condition>().unwrap().evaluate(&ctx));
    }

    #[test]
    fn conjunction_of_platform_and_mode() {
        let options = ActiveOptions::new();
        let env = env();
        let head = EvalContext {
            options: &options,
            mode: BuildMode::Head,
            env: &env,
        };

        let cond: Condition = "head && arch:intel && os>=10.7 && compiler:clang"
            .parse()
            .unwrap();
        assert!(cond.evaluate(&head));

        let stable = EvalContext {
            mode: BuildMode::Stable,
            ..head
        };
        assert!(!cond.evaluate(&stable));
        assert!("os<10.10".parse::<Condition>().unwrap().evaluate(&stable));
    }

    #[test]
    fn rejects_unknown_predicates() {
        assert!("sometimes".parse::<Condition>().is_err());
        assert!("with:qt &&".parse::<Condition>().is_err());
        assert!("arch:ppc".parse::<Condition>().is_err());
    }

    #[test]
    fn referenced_options_lists_option_atoms() {
        let cond: Condition = "with:qt && !option:enable-spam && head".parse().unwrap();
        let names: Vec<&str> = cond.referenced_options().collect();
        assert_eq!(names, vec!["with-qt", "enable-spam"]);
    }
}
