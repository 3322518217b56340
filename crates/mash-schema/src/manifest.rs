//! Formula manifests.
//!
//! A manifest is the declarative build recipe of one package. On disk it is
//! a TOML file; in memory it is an immutable, validated [`Manifest`].
//!
//! ```toml
//! [package]
//! name = "example"
//! homepage = "https://www.example.com"
//!
//! [source]
//! url = "https://example.com/archive-1.2.3.tar.gz"
//! sha256 = "..."
//!
//! [[dependencies]]
//! name = "cmake"
//! kind = "build"
//!
//! [[steps]]
//! run = ["./configure", "--prefix={prefix}"]
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::{self, PLACEHOLDERS, Step, StepAction};
use crate::version::detect_version;
use crate::{
    ActiveOptions, Arch, BuildMode, CompilerKind, Condition, Environment, EvalContext, OptionDecl,
    Os, PackageName, Sha256Digest, Version, condition,
};

/// Errors raised while loading a manifest.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The manifest file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be deserialized.
    #[error("malformed manifest{}: {source}", at_path(.path.as_ref()))]
    Toml {
        /// File the content came from, when known.
        path: Option<PathBuf>,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// The manifest parsed but violates a rule.
    #[error("invalid manifest '{name}': {field}: {reason}")]
    Invalid {
        /// Package name (or `<unnamed>`).
        name: String,
        /// Offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn at_path(path: Option<&PathBuf>) -> String {
    path.map(|p| format!(" {}", p.display())).unwrap_or_default()
}

/// How a source locator is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchKind {
    /// Download and extract an archive (`:curl`).
    #[serde(alias = "curl")]
    Archive,
    /// Download without extracting.
    NoUnzip,
    /// Git checkout.
    Git,
    /// Mercurial checkout.
    Hg,
    /// Subversion checkout.
    Svn,
    /// Bazaar checkout.
    Bzr,
    /// CVS checkout.
    Cvs,
}

impl FetchKind {
    /// Whether this is a version control checkout.
    pub fn is_vcs(&self) -> bool {
        !matches!(self, Self::Archive | Self::NoUnzip)
    }

    fn infer(url: &str) -> Self {
        let lower = url.to_lowercase();
        if lower.ends_with(".git") || lower.starts_with("git://") || lower.starts_with("git+") {
            Self::Git
        } else if lower.starts_with("svn://") || lower.starts_with("svn+") {
            Self::Svn
        } else if lower.starts_with("hg://") {
            Self::Hg
        } else {
            Self::Archive
        }
    }
}

/// Where and how to fetch a source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocator {
    /// Primary URL.
    pub url: String,
    /// Fetch strategy.
    pub kind: FetchKind,
    /// Expected SHA-256 of the downloaded file (archives only).
    pub checksum: Option<Sha256Digest>,
    /// Fallback URLs tried in order when the primary is unreachable.
    pub mirrors: Vec<String>,
    /// VCS tag to check out.
    pub tag: Option<String>,
    /// VCS branch to check out.
    pub branch: Option<String>,
    /// VCS revision to check out (wins over tag and branch).
    pub revision: Option<String>,
    /// Explicitly declared as having no checksum.
    pub unverified: bool,
}

impl SourceLocator {
    /// All URLs in the order they are tried.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }
}

/// Kind of a dependency declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed at build time and at runtime.
    Required,
    /// Needed only while building (`=> :build`).
    #[serde(alias = "build-only", alias = "build_only")]
    Build,
    /// Off unless its controlling option is enabled (`=> :optional`).
    Optional,
    /// On unless its controlling option is disabled (`=> :recommended`).
    Recommended,
    /// Must not be present in the same plan (`conflicts_with`).
    #[serde(alias = "conflict")]
    Conflicting,
}

impl DependencyKind {
    /// Edges that impose build ordering when active.
    pub fn orders_build(&self) -> bool {
        !matches!(self, Self::Conflicting)
    }

    /// Edges whose target is needed at runtime by the dependent.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Required | Self::Optional | Self::Recommended)
    }

    /// Edges gated by an option.
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Optional | Self::Recommended)
    }
}

/// One dependency (or conflict) declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Target formula.
    pub name: PackageName,
    /// Declaration kind.
    pub kind: DependencyKind,
    /// Options the target must be built with (`depends_on 'qt' => 'with-qtdbus'`).
    pub options: Vec<String>,
    /// Only declared when this condition holds for the dependent.
    pub when: Option<Condition>,
    /// Controlling option for optional/recommended edges.
    pub option: Option<String>,
    /// Free text reason (conflicts).
    pub because: Option<String>,
}

/// Architecture constraint of a requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchRequirement {
    /// Must build on this architecture.
    Is(Arch),
    /// An architecture mash cannot target (`ppc`); never satisfied.
    Unsupported(String),
}

/// What a requirement demands from the target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementKind {
    /// `depends_on :arch => :intel`
    Arch(ArchRequirement),
    /// Operating system family.
    Os(Os),
    /// `depends_on :macos => :lion` (minimum OS version).
    MinOs(Version),
    /// A host tool (`:xcode`, `:fortran`, `:x11`).
    Tool(String),
}

/// A platform predicate that must hold for a formula to be buildable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// The predicate.
    pub kind: RequirementKind,
    /// Only applies when this condition holds.
    pub when: Option<Condition>,
}

impl Requirement {
    /// Check against an environment; `Err` carries a human readable reason.
    ///
    /// # Errors
    ///
    /// Returns the reason the requirement is not met.
    pub fn check(&self, env: &Environment) -> Result<(), String> {
        match &self.kind {
            RequirementKind::Arch(ArchRequirement::Is(arch)) if env.arch == *arch => Ok(()),
            RequirementKind::Arch(ArchRequirement::Is(arch)) => Err(format!(
                "requires architecture {arch}, target is {}",
                env.arch
            )),
            RequirementKind::Arch(ArchRequirement::Unsupported(name)) => {
                Err(format!("requires unsupported architecture {name}"))
            }
            RequirementKind::Os(os) if env.os == *os => Ok(()),
            RequirementKind::Os(os) => Err(format!("requires {os}, target is {}", env.os)),
            RequirementKind::MinOs(min) if env.os_version >= *min => Ok(()),
            RequirementKind::MinOs(min) => Err(format!(
                "requires OS version {min} or newer, target is {}",
                env.os_version
            )),
            RequirementKind::Tool(tool) if env.has_tool(tool) => Ok(()),
            RequirementKind::Tool(tool) => Err(format!("requires host tool '{tool}'")),
        }
    }
}

/// A known compiler failure (`fails_with :clang do build 425 end`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerFailure {
    /// Failing compiler family.
    pub compiler: CompilerKind,
    /// Builds up to and including this one fail; `None` means every build.
    #[serde(default)]
    pub build: Option<u32>,
    /// Why it fails.
    #[serde(default)]
    pub cause: String,
}

impl CompilerFailure {
    /// Whether the environment's compiler is affected.
    ///
    /// An environment whose compiler build is unknown is only affected by
    /// declarations without a build bound.
    pub fn affects(&self, env: &Environment) -> bool {
        if env.compiler.kind != self.compiler {
            return false;
        }
        match (self.build, env.compiler.build) {
            (None, _) => true,
            (Some(limit), Some(actual)) => actual <= limit,
            (Some(_), None) => false,
        }
    }
}

/// An auxiliary download staged during one formula's build (a sub-formula).
///
/// Resources are never graph nodes: no other formula can depend on one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Name referenced by `stage` steps.
    pub name: String,
    /// Where to fetch it.
    pub source: SourceLocator,
}

/// Where a patch's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchSource {
    /// Downloaded and verified like any other source.
    Remote(SourceLocator),
    /// Embedded diff text.
    Inline(String),
}

/// A named patch attachment applied before the install steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Attachment name.
    pub name: String,
    /// Diff content.
    pub source: PatchSource,
    /// `patch -p<strip>` level.
    pub strip: u8,
    /// Only applied when this condition holds.
    pub when: Option<Condition>,
}

/// A validated, immutable formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    /// Unique package name.
    pub name: PackageName,
    /// Stable version.
    pub version: Version,
    /// Project homepage.
    pub homepage: String,
    /// One-line description.
    pub description: String,
    /// Primary source.
    pub source: SourceLocator,
    /// Alternate VCS source used with `--HEAD`.
    pub head: Option<SourceLocator>,
    /// Alternate pre-release source used with `--devel`, with its version.
    pub devel: Option<(SourceLocator, Version)>,
    /// Declared and auto-generated options, sorted by name.
    pub options: Vec<OptionDecl>,
    /// Dependency and conflict declarations.
    pub dependencies: Vec<Dependency>,
    /// Platform requirements (all must hold).
    pub requirements: Vec<Requirement>,
    /// Known compiler failures.
    pub fails_with: Vec<CompilerFailure>,
    /// Auxiliary resources.
    pub resources: Vec<Resource>,
    /// Patch attachments, applied in order.
    pub patches: Vec<Patch>,
    /// Install procedure.
    pub steps: Vec<Step>,
    /// Optional test procedure.
    pub test: Vec<Step>,
    /// Post-install message.
    pub caveats: Option<String>,
    /// Reason this formula is not linked into the shared prefix.
    pub keg_only: Option<String>,
}

impl Manifest {
    /// Parse and validate a manifest from a file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ParseError> {
        let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawManifest = toml::from_str(&content).map_err(|source| ParseError::Toml {
            path: Some(path.to_path_buf()),
            source,
        })?;
        raw.validate()
    }

    /// Parse and validate a manifest from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the text is malformed or invalid.
    pub fn load(content: &str) -> Result<Self, ParseError> {
        let raw: RawManifest =
            toml::from_str(content).map_err(|source| ParseError::Toml { path: None, source })?;
        raw.validate()
    }

    /// Source locator used for a build mode, if the formula has one.
    pub fn locator(&self, mode: BuildMode) -> Option<&SourceLocator> {
        match mode {
            BuildMode::Stable => Some(&self.source),
            BuildMode::Head => self.head.as_ref(),
            BuildMode::Devel => self.devel.as_ref().map(|(loc, _)| loc),
        }
    }

    /// Version a build in `mode` produces.
    pub fn version_for(&self, mode: BuildMode) -> Version {
        match mode {
            BuildMode::Stable => self.version.clone(),
            BuildMode::Head => Version::from(Version::HEAD),
            BuildMode::Devel => self
                .devel
                .as_ref()
                .map_or_else(|| self.version.clone(), |(_, v)| v.clone()),
        }
    }

    /// Option that switches an optional/recommended dependency on.
    pub fn controlling_option(dep: &Dependency) -> String {
        dep.option
            .clone()
            .unwrap_or_else(|| format!("with-{}", dep.name))
    }

    /// Whether the manifest declares (or auto-generates) `option`.
    pub fn declares_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o.name == option)
    }

    /// Defaults for every declared option.
    pub fn default_options(&self) -> ActiveOptions {
        let mut active = ActiveOptions::new();
        for option in &self.options {
            active.set(option.name.clone(), option.default);
        }
        active
    }

    /// Conflict declarations.
    pub fn conflicts(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Conflicting)
    }

    /// Whether `other` is declared as conflicting (condition aside).
    pub fn conflict_with(&self, other: &PackageName) -> Option<&Dependency> {
        self.conflicts().find(|d| &d.name == other)
    }

    /// Whether a dependency edge is active for the given build context.
    pub fn edge_active(dep: &Dependency, ctx: &EvalContext<'_>) -> bool {
        if !condition::holds(dep.when.as_ref(), ctx) {
            return false;
        }
        match dep.kind {
            DependencyKind::Required | DependencyKind::Build => true,
            DependencyKind::Optional | DependencyKind::Recommended => {
                ctx.options.is_enabled(&Self::controlling_option(dep))
            }
            DependencyKind::Conflicting => false,
        }
    }

    /// Look up a resource by name.
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    package: RawPackage,
    source: RawSource,
    head: Option<RawSource>,
    devel: Option<RawSource>,
    #[serde(default)]
    options: Vec<OptionDecl>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    #[serde(default)]
    conflicts: Vec<RawConflict>,
    #[serde(default)]
    requirements: Vec<RawRequirement>,
    #[serde(default)]
    fails_with: Vec<CompilerFailure>,
    #[serde(default)]
    resources: Vec<RawResource>,
    #[serde(default)]
    patches: Vec<RawPatch>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    test: Option<RawTest>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPackage {
    name: String,
    version: Option<String>,
    #[serde(default)]
    homepage: String,
    #[serde(default)]
    description: String,
    caveats: Option<String>,
    keg_only: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    url: String,
    sha256: Option<Sha256Digest>,
    using: Option<FetchKind>,
    #[serde(default)]
    mirrors: Vec<String>,
    tag: Option<String>,
    branch: Option<String>,
    revision: Option<String>,
    #[serde(default)]
    unverified: bool,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependency {
    name: String,
    #[serde(default = "default_kind")]
    kind: DependencyKind,
    #[serde(default)]
    options: Vec<String>,
    when: Option<Condition>,
    option: Option<String>,
    because: Option<String>,
}

fn default_kind() -> DependencyKind {
    DependencyKind::Required
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConflict {
    name: String,
    because: Option<String>,
    when: Option<Condition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequirement {
    arch: Option<String>,
    os: Option<Os>,
    min_os: Option<String>,
    tool: Option<String>,
    when: Option<Condition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    name: String,
    url: String,
    sha256: Option<Sha256Digest>,
    using: Option<FetchKind>,
    #[serde(default)]
    mirrors: Vec<String>,
    tag: Option<String>,
    branch: Option<String>,
    revision: Option<String>,
    #[serde(default)]
    unverified: bool,
}

impl RawResource {
    fn into_parts(self) -> (String, RawSource) {
        (
            self.name,
            RawSource {
                url: self.url,
                sha256: self.sha256,
                using: self.using,
                mirrors: self.mirrors,
                tag: self.tag,
                branch: self.branch,
                revision: self.revision,
                unverified: self.unverified,
                version: None,
            },
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPatch {
    name: String,
    url: Option<String>,
    sha256: Option<Sha256Digest>,
    #[serde(default)]
    mirrors: Vec<String>,
    data: Option<String>,
    #[serde(default = "default_strip")]
    strip: u8,
    when: Option<Condition>,
}

fn default_strip() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTest {
    #[serde(default)]
    steps: Vec<Step>,
}

/// Collects validation failures for one manifest.
struct Validator {
    name: String,
}

impl Validator {
    fn fail(&self, field: impl Into<String>, reason: impl Into<String>) -> ParseError {
        ParseError::Invalid {
            name: self.name.clone(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    fn locator(&self, field: &str, raw: RawSource) -> Result<SourceLocator, ParseError> {
        if raw.url.trim().is_empty() {
            return Err(self.fail(format!("{field}.url"), "must not be empty"));
        }
        let kind = raw.using.unwrap_or_else(|| FetchKind::infer(&raw.url));

        if kind.is_vcs() {
            if raw.sha256.is_some() {
                return Err(self.fail(
                    format!("{field}.sha256"),
                    "checkouts are pinned by tag/branch/revision, not by checksum",
                ));
            }
        } else if raw.sha256.is_none() && !raw.unverified {
            return Err(self.fail(
                format!("{field}.sha256"),
                "checksum required (or mark the source `unverified = true`)",
            ));
        } else if raw.sha256.is_some() && raw.unverified {
            return Err(self.fail(
                format!("{field}.unverified"),
                "a source with a checksum cannot also be unverified",
            ));
        }

        Ok(SourceLocator {
            url: raw.url,
            kind,
            checksum: raw.sha256,
            mirrors: raw.mirrors,
            tag: raw.tag,
            branch: raw.branch,
            revision: raw.revision,
            unverified: raw.unverified || kind.is_vcs(),
        })
    }
}

impl RawManifest {
    fn validate(self) -> Result<Manifest, ParseError> {
        let v = Validator {
            name: if self.package.name.trim().is_empty() {
                "<unnamed>".to_string()
            } else {
                self.package.name.clone()
            },
        };

        if self.package.name.trim().is_empty() {
            return Err(v.fail("package.name", "must not be empty"));
        }
        if self
            .package
            .name
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '{' || c == '}')
        {
            return Err(v.fail("package.name", "must not contain whitespace, '/' or braces"));
        }
        let name = PackageName::new(&self.package.name);

        let declared_version = self.package.version.clone().or(self.source.version.clone());
        let source = v.locator("source", self.source)?;
        let version = match declared_version {
            Some(ver) if !ver.trim().is_empty() => Version::from(ver.trim()),
            _ => detect_version(&source.url).ok_or_else(|| {
                v.fail(
                    "package.version",
                    "not declared and not detectable from the source url",
                )
            })?,
        };

        let head = match self.head {
            Some(raw) => {
                let loc = v.locator("head", raw)?;
                Some(loc)
            }
            None => None,
        };

        let devel = match self.devel {
            Some(raw) => {
                let explicit = raw.version.clone();
                let loc = v.locator("devel", raw)?;
                let ver = explicit
                    .map(Version::from)
                    .or_else(|| detect_version(&loc.url))
                    .ok_or_else(|| v.fail("devel.version", "not declared and not detectable"))?;
                Some((loc, ver))
            }
            None => None,
        };

        // Dependencies and conflicts
        let mut dependencies = Vec::new();
        let mut seen = BTreeSet::new();
        for raw in self.dependencies {
            let dep_name = PackageName::new(&raw.name);
            if dep_name.is_empty() {
                return Err(v.fail("dependencies.name", "must not be empty"));
            }
            if dep_name == name {
                return Err(v.fail("dependencies", "a formula cannot depend on itself"));
            }
            if !seen.insert(dep_name.clone()) {
                return Err(v.fail(
                    "dependencies",
                    format!("'{dep_name}' is declared more than once"),
                ));
            }
            if raw.option.is_some() && !raw.kind.is_optional() {
                return Err(v.fail(
                    format!("dependencies.{dep_name}.option"),
                    "only optional and recommended dependencies have a controlling option",
                ));
            }
            dependencies.push(Dependency {
                name: dep_name,
                kind: raw.kind,
                options: raw.options,
                when: raw.when,
                option: raw.option,
                because: raw.because,
            });
        }
        for raw in self.conflicts {
            let other = PackageName::new(&raw.name);
            if other == name {
                return Err(v.fail("conflicts", "a formula cannot conflict with itself"));
            }
            if !seen.insert(other.clone()) {
                return Err(v.fail(
                    "conflicts",
                    format!("'{other}' is both a dependency and a conflict"),
                ));
            }
            dependencies.push(Dependency {
                name: other,
                kind: DependencyKind::Conflicting,
                options: Vec::new(),
                when: raw.when,
                option: None,
                because: raw.because,
            });
        }

        // Options: declared ones first, then generated ones for gated deps
        let mut options: Vec<OptionDecl> = Vec::new();
        for decl in self.options {
            let trimmed = decl.name.trim_start_matches('-').to_string();
            if trimmed.is_empty() {
                return Err(v.fail("options.name", "must not be empty"));
            }
            if options.iter().any(|o| o.name == trimmed) {
                return Err(v.fail("options", format!("'{trimmed}' is declared more than once")));
            }
            options.push(OptionDecl {
                name: trimmed,
                ..decl
            });
        }
        for dep in dependencies.iter().filter(|d| d.kind.is_optional()) {
            let option = Manifest::controlling_option(dep);
            if !options.iter().any(|o| o.name == option) {
                let recommended = dep.kind == DependencyKind::Recommended;
                options.push(OptionDecl {
                    description: if recommended {
                        format!("Build without {} support", dep.name)
                    } else {
                        format!("Build with {} support", dep.name)
                    },
                    name: option,
                    default: recommended,
                });
            }
        }
        options.sort_by(|a, b| a.name.cmp(&b.name));

        let declared = |option: &str| options.iter().any(|o| o.name == option);
        let check_condition = |field: &str, cond: Option<&Condition>| -> Result<(), ParseError> {
            if let Some(cond) = cond {
                for option in cond.referenced_options() {
                    if !declared(option) {
                        return Err(v.fail(
                            field.to_string(),
                            format!("condition '{cond}' refers to undeclared option '{option}'"),
                        ));
                    }
                }
            }
            Ok(())
        };
        for dep in &dependencies {
            check_condition(&format!("dependencies.{}.when", dep.name), dep.when.as_ref())?;
        }

        // Requirements
        let mut requirements = Vec::new();
        for raw in self.requirements {
            check_condition("requirements.when", raw.when.as_ref())?;
            let mut kinds = Vec::new();
            if let Some(arch) = raw.arch {
                kinds.push(RequirementKind::Arch(match arch.parse::<Arch>() {
                    Ok(a) => ArchRequirement::Is(a),
                    Err(_) => ArchRequirement::Unsupported(arch),
                }));
            }
            if let Some(os) = raw.os {
                kinds.push(RequirementKind::Os(os));
            }
            if let Some(min) = raw.min_os {
                kinds.push(RequirementKind::MinOs(Version::from(min.trim())));
            }
            if let Some(tool) = raw.tool {
                kinds.push(RequirementKind::Tool(tool.to_lowercase()));
            }
            if kinds.len() != 1 {
                return Err(v.fail(
                    "requirements",
                    "each requirement needs exactly one of arch, os, min_os, tool",
                ));
            }
            requirements.push(Requirement {
                kind: kinds.remove(0),
                when: raw.when,
            });
        }

        // Resources
        let mut resources: Vec<Resource> = Vec::new();
        for raw in self.resources {
            let (name, raw_source) = raw.into_parts();
            if resources.iter().any(|r| r.name == name) {
                return Err(v.fail("resources", format!("'{name}' declared twice")));
            }
            let source = v.locator(&format!("resources.{name}"), raw_source)?;
            resources.push(Resource { name, source });
        }

        // Patches
        let mut patches: Vec<Patch> = Vec::new();
        for raw in self.patches {
            if patches.iter().any(|p| p.name == raw.name) {
                return Err(v.fail("patches", format!("'{}' declared twice", raw.name)));
            }
            check_condition(&format!("patches.{}.when", raw.name), raw.when.as_ref())?;
            let source = match (raw.url, raw.data) {
                (Some(url), None) => PatchSource::Remote(v.locator(
                    &format!("patches.{}", raw.name),
                    RawSource {
                        url,
                        sha256: raw.sha256,
                        using: Some(FetchKind::NoUnzip),
                        mirrors: raw.mirrors,
                        tag: None,
                        branch: None,
                        revision: None,
                        unverified: false,
                        version: None,
                    },
                )?),
                (None, Some(data)) => PatchSource::Inline(data),
                _ => {
                    return Err(v.fail(
                        format!("patches.{}", raw.name),
                        "needs exactly one of `url` (with `sha256`) or `data`",
                    ));
                }
            };
            patches.push(Patch {
                name: raw.name,
                source,
                strip: raw.strip,
                when: raw.when,
            });
        }

        // Steps: placeholders, `opt:` targets, staged resources
        let opt_targets: BTreeSet<&str> = dependencies
            .iter()
            .filter(|d| d.kind.orders_build())
            .map(|d| d.name.as_str())
            .collect();
        let test_steps = self.test.map(|t| t.steps).unwrap_or_default();
        for (section, steps) in [("steps", &self.steps), ("test.steps", &test_steps)] {
            for (idx, step) in steps.iter().enumerate() {
                let field = format!("{section}[{idx}]");
                check_condition(&field, step.when.as_ref())?;
                for template in step.templates() {
                    step::expand(template, |placeholder| {
                        let known = match placeholder.strip_prefix("opt:") {
                            Some(dep) => opt_targets.contains(dep.to_lowercase().as_str()),
                            None => PLACEHOLDERS.contains(&placeholder),
                        };
                        known.then(String::new)
                    })
                    .map_err(|e| v.fail(field.clone(), e.to_string()))?;
                }
                if let StepAction::Stage { resource, .. } = &step.action
                    && !resources.iter().any(|r| &r.name == resource)
                {
                    return Err(v.fail(field, format!("unknown resource '{resource}'")));
                }
            }
        }

        Ok(Manifest {
            name,
            version,
            homepage: self.package.homepage,
            description: self.package.description,
            source,
            head,
            devel,
            options,
            dependencies,
            requirements,
            fails_with: self.fails_with,
            resources,
            patches,
            steps: self.steps,
            test: test_steps,
            caveats: self.package.caveats,
            keg_only: self.package.keg_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "cafebabe78901234567890123456789012345678901234567890123456789012";

    fn example() -> String {
        format!(
            r#"
            [package]
            name = "Example-Formula"
            homepage = "http://www.example.com"
            caveats = "Something the user should know"

            [source]
            url = "https://example.com/archive-1.2.3.tar.bz2"
            mirrors = ["https://mirror.example.com/archive-1.2.3.tar.bz2"]
            sha256 = "{SHA}"

            [head]
            url = "https://example.com/repo.git"
            branch = "main"

            [devel]
            url = "https://example.com/archive-2.0-beta.tar.gz"
            sha256 = "{SHA}"

            [[options]]
            name = "enable-spam"
            description = "The description goes here"

            [[dependencies]]
            name = "cmake"
            kind = "build"

            [[dependencies]]
            name = "readline"
            kind = "recommended"

            [[dependencies]]
            name = "glib"
            kind = "optional"

            [[dependencies]]
            name = "zeromq"
            options = ["with-pgm"]

            [[dependencies]]
            name = "autoconf"
            kind = "build"
            when = "head"

            [[conflicts]]
            name = "imagemagick"
            because = "because this is just an example"

            [[requirements]]
            arch = "intel"

            [[fails_with]]
            compiler = "clang"
            build = 425
            cause = "multiple configure and compile errors"

            [[resources]]
            name = "additional-stuff"
            url = "https://example.com/additional-stuff.tar.gz"
            sha256 = "{SHA}"

            [[patches]]
            name = "embedded"
            data = "--- a/x\n+++ b/x\n"

            [[steps]]
            run = ["./configure", "--prefix={{prefix}}", "--with-readline={{opt:readline}}/lib"]

            [[steps]]
            run = ["make", "install"]

            [[steps]]
            stage = "additional-stuff"
            into = "{{libexec}}"
            "#
        )
    }

    #[test]
    fn loads_the_full_example() {
        let m = Manifest::load(&example()).unwrap();

        assert_eq!(m.name, "example-formula");
        assert_eq!(m.version, "1.2.3");
        assert_eq!(m.source.kind, FetchKind::Archive);
        assert_eq!(m.head.as_ref().unwrap().kind, FetchKind::Git);
        assert_eq!(m.version_for(BuildMode::Head), "HEAD");
        assert_eq!(m.version_for(BuildMode::Devel), "2.0-beta");
        assert_eq!(m.conflicts().count(), 1);
        assert_eq!(m.source.urls().count(), 2);
        assert_eq!(m.steps.len(), 3);
        assert_eq!(m.patches[0].source, PatchSource::Inline("--- a/x\n+++ b/x\n".into()));
    }

    #[test]
    fn gated_dependencies_generate_options() {
        let m = Manifest::load(&example()).unwrap();
        let defaults = m.default_options();

        assert!(m.declares_option("with-glib"));
        assert!(m.declares_option("with-readline"));
        assert!(!defaults.is_enabled("with-glib"), "optional defaults off");
        assert!(defaults.is_enabled("with-readline"), "recommended defaults on");
        assert!(!defaults.is_enabled("enable-spam"));

        let names: Vec<&str> = m.options.iter().map(|o| o.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn archive_sources_need_a_checksum() {
        let text = r#"
            [package]
            name = "nosum"
            [source]
            url = "https://example.com/nosum-1.0.tar.gz"
        "#;
        let err = Manifest::load(text).unwrap_err();
        assert!(err.to_string().contains("source.sha256"), "{err}");

        let unverified = text.replace(".tar.gz\"", ".tar.gz\"\nunverified = true");
        let m = Manifest::load(&unverified).unwrap();
        assert!(m.source.unverified);
        assert!(m.source.checksum.is_none());
    }

    #[test]
    fn rejects_missing_version_and_empty_name() {
        let no_version = format!(
            "[package]\nname = \"x\"\n[source]\nurl = \"https://e.com/x.tar.gz\"\nsha256 = \"{SHA}\"\n"
        );
        assert!(Manifest::load(&no_version).is_err());

        let empty = format!(
            "[package]\nname = \"\"\n[source]\nurl = \"https://e.com/x-1.0.tar.gz\"\nsha256 = \"{SHA}\"\n"
        );
        let err = Manifest::load(&empty).unwrap_err();
        assert!(err.to_string().contains("package.name"));
    }

    #[test]
    fn rejects_unknown_placeholders_and_opt_targets() {
        let base = format!(
            "[package]\nname = \"x\"\n[source]\nurl = \"https://e.com/x-1.0.tar.gz\"\nsha256 = \"{SHA}\"\n"
        );
        let bad_placeholder = format!("{base}[[steps]]\nrun = [\"echo\", \"{{nowhere}}\"]\n");
        assert!(Manifest::load(&bad_placeholder).is_err());

        let bad_opt = format!("{base}[[steps]]\nrun = [\"echo\", \"{{opt:zlib}}\"]\n");
        assert!(Manifest::load(&bad_opt).is_err());

        let good_opt = format!(
            "{base}[[dependencies]]\nname = \"zlib\"\n[[steps]]\nrun = [\"echo\", \"{{opt:zlib}}\"]\n"
        );
        assert!(Manifest::load(&good_opt).is_ok());
    }

    #[test]
    fn conditions_must_reference_declared_options() {
        let text = format!(
            "[package]\nname = \"x\"\n[source]\nurl = \"https://e.com/x-1.0.tar.gz\"\nsha256 = \"{SHA}\"\n\
             [[dependencies]]\nname = \"postgresql\"\nwhen = \"without:sqlite\"\n"
        );
        let err = Manifest::load(&text).unwrap_err();
        assert!(err.to_string().contains("with-sqlite"), "{err}");
    }

    #[test]
    fn requirement_and_compiler_checks() {
        use crate::{Compiler, Environment};

        let mut env = Environment {
            os: Os::MacOs,
            os_version: Version::from("10.8"),
            arch: Arch::Arm64,
            compiler: Compiler {
                kind: CompilerKind::Clang,
                build: Some(421),
            },
            tools: BTreeSet::new(),
        };
        let intel = Requirement {
            kind: RequirementKind::Arch(ArchRequirement::Is(Arch::X86_64)),
            when: None,
        };
        assert!(intel.check(&env).is_err());
        env.arch = Arch::X86_64;
        assert!(intel.check(&env).is_ok());

        let failure = CompilerFailure {
            compiler: CompilerKind::Clang,
            build: Some(425),
            cause: String::new(),
        };
        assert!(failure.affects(&env));
        env.compiler.build = Some(500);
        assert!(!failure.affects(&env));
    }
}
