//! Resolver inputs and outputs.

use std::collections::{BTreeMap, BTreeSet};

use mash_schema::{
    ActiveOptions, BuildMode, DependencyKind, Environment, Manifest, OptionFingerprint,
    PackageName, SourceLocator, Version,
};
use serde::Serialize;

/// What the user asked for, per package.
///
/// Packages not mentioned build in stable mode with their manifest defaults
/// (plus whatever sub-options their dependents demand).
#[derive(Debug, Clone, Default)]
pub struct OptionSelection {
    overrides: BTreeMap<PackageName, BTreeMap<String, bool>>,
    modes: BTreeMap<PackageName, BuildMode>,
}

impl OptionSelection {
    /// Empty selection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn an option of `name` on or off.
    pub fn set(&mut self, name: &PackageName, option: impl Into<String>, enabled: bool) {
        self.overrides
            .entry(name.clone())
            .or_default()
            .insert(option.into(), enabled);
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: &str, option: &str, enabled: bool) -> Self {
        self.set(&PackageName::new(name), option, enabled);
        self
    }

    /// Build `name` from its head or devel locator.
    pub fn set_mode(&mut self, name: &PackageName, mode: BuildMode) {
        self.modes.insert(name.clone(), mode);
    }

    /// Explicit overrides for one package.
    pub fn overrides(&self, name: &PackageName) -> impl Iterator<Item = (&str, bool)> {
        self.overrides
            .get(name)
            .into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), *v)))
    }

    /// Explicit value for one option, if the user gave one.
    pub fn explicit(&self, name: &PackageName, option: &str) -> Option<bool> {
        self.overrides.get(name)?.get(option).copied()
    }

    /// Build mode for a package.
    pub fn mode(&self, name: &PackageName) -> BuildMode {
        self.modes.get(name).copied().unwrap_or_default()
    }
}

/// An active edge from a plan node to one of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEdge {
    /// Dependency name.
    pub to: PackageName,
    /// Declared kind.
    pub kind: DependencyKind,
}

/// One package build in a [`BuildPlan`].
#[derive(Debug, Clone, Serialize)]
pub struct PlanNode {
    /// The formula.
    pub manifest: Manifest,
    /// Version this build produces.
    pub version: Version,
    /// Source locator used.
    pub locator: SourceLocator,
    /// Build mode.
    pub mode: BuildMode,
    /// Resolved options.
    pub options: ActiveOptions,
    /// Fingerprint of `options` and `mode`.
    pub fingerprint: OptionFingerprint,
    /// Active dependency edges, sorted by target name.
    pub edges: Vec<PlanEdge>,
    /// Needed only to build other nodes.
    pub build_only: bool,
    /// Named by the user.
    pub requested: bool,
}

impl PlanNode {
    /// Formula name.
    pub fn name(&self) -> &PackageName {
        &self.manifest.name
    }

    /// Direct dependencies (active edges).
    pub fn dependencies(&self) -> impl Iterator<Item = &PackageName> {
        self.edges.iter().map(|e| &e.to)
    }
}

/// A topologically ordered set of builds for one target environment.
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    /// Nodes; every dependency precedes its dependents.
    pub nodes: Vec<PlanNode>,
    /// Environment the plan was resolved for.
    pub environment: Environment,
}

impl BuildPlan {
    /// Node by name.
    pub fn get(&self, name: &PackageName) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Position of a node in the build order.
    pub fn position(&self, name: &PackageName) -> Option<usize> {
        self.nodes.iter().position(|n| n.name() == name)
    }

    /// Names in build order.
    pub fn order(&self) -> Vec<&PackageName> {
        self.nodes.iter().map(PlanNode::name).collect()
    }

    /// Plan nodes that depend on `name` through an active edge, with the edge kind.
    pub fn dependents<'a>(
        &'a self,
        name: &'a PackageName,
    ) -> impl Iterator<Item = (&'a PlanNode, DependencyKind)> + 'a {
        self.nodes.iter().filter_map(move |n| {
            n.edges
                .iter()
                .find(|e| &e.to == name)
                .map(|e| (n, e.kind))
        })
    }

    /// Packages whose `opt/` prefixes a node's build environment exposes.
    ///
    /// These are the node's direct active dependencies plus, transitively,
    /// the runtime (non build-only) dependencies of those. Sorted by name.
    pub fn environment_dependencies(&self, name: &PackageName) -> Vec<PackageName> {
        let mut seen = BTreeSet::new();
        let Some(node) = self.get(name) else {
            return Vec::new();
        };
        let mut queue: Vec<&PackageName> = node.dependencies().collect();
        while let Some(dep) = queue.pop() {
            if !seen.insert(dep.clone()) {
                continue;
            }
            if let Some(dep_node) = self.get(dep) {
                queue.extend(
                    dep_node
                        .edges
                        .iter()
                        .filter(|e| e.kind.is_runtime())
                        .map(|e| &e.to),
                );
            }
        }
        seen.into_iter().collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
