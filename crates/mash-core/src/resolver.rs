use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use mash_schema::{
    ActiveOptions, DependencyKind, Environment, EvalContext, Manifest, PackageName, condition,
};

use crate::error::ResolutionError;
use crate::plan::{BuildPlan, OptionSelection, PlanEdge, PlanNode};
use crate::registry::ManifestSet;

/// Sub-options demanded of a package: option -> first dependent demanding it.
type Demands = BTreeMap<PackageName, BTreeMap<String, PackageName>>;

/// The transitive closure of the targets under one set of demands.
struct Expansion {
    options: BTreeMap<PackageName, ActiveOptions>,
    edges: BTreeMap<PackageName, Vec<PlanEdge>>,
}

/// Resolves targets into a [`BuildPlan`] for a declared environment.
///
/// Resolution is a pure function of (manifests, targets, selection,
/// environment): it never looks at the host or the filesystem.
#[derive(Debug)]
pub struct Resolver<'a> {
    manifests: &'a ManifestSet,
    selection: &'a OptionSelection,
    env: &'a Environment,
}

/// Resolves `targets` and returns them, with their dependencies, in build order.
///
/// Follows only active edges: required and build-only edges always,
/// optional/recommended edges when their controlling option is on, and
/// only when the edge's condition holds for the dependent.
///
/// # Errors
///
/// Returns [`ResolutionError`] when a name is unknown, the active graph has
/// a cycle, two plan members conflict, or a requirement is not met by `env`.
pub fn resolve(
    manifests: &ManifestSet,
    targets: &[PackageName],
    selection: &OptionSelection,
    env: &Environment,
) -> Result<BuildPlan, ResolutionError> {
    Resolver::new(manifests, selection, env).resolve(targets)
}

impl<'a> Resolver<'a> {
    /// Create a resolver over a manifest set.
    pub fn new(
        manifests: &'a ManifestSet,
        selection: &'a OptionSelection,
        env: &'a Environment,
    ) -> Self {
        Self {
            manifests,
            selection,
            env,
        }
    }

    /// See [`resolve`].
    ///
    /// # Errors
    ///
    /// See [`resolve`].
    pub fn resolve(&self, targets: &[PackageName]) -> Result<BuildPlan, ResolutionError> {
        let requested: BTreeSet<PackageName> = targets.iter().cloned().collect();
        for name in &requested {
            if !self.manifests.contains(name) {
                return Err(ResolutionError::UnknownPackage {
                    name: name.clone(),
                    required_by: None,
                });
            }
        }

        // 1. Expansion, to a fixpoint of demanded sub-options
        let mut demands = Demands::new();
        let expansion = loop {
            let (expansion, found) = self.expand(&requested, &demands)?;
            let mut grew = false;
            for (name, options) in found {
                let known = demands.entry(name).or_default();
                for (option, by) in options {
                    if let Entry::Vacant(slot) = known.entry(option) {
                        slot.insert(by);
                        grew = true;
                    }
                }
            }
            if !grew {
                break expansion;
            }
        };

        // 2. Cycles
        if let Some(path) = find_cycle(&expansion.edges) {
            return Err(ResolutionError::Cycle { path });
        }

        // 3. Order
        let order = topological_order(&expansion.edges)?;

        // 4. Conflicts
        self.check_conflicts(&expansion)?;

        // 5. Requirements
        for name in &order {
            let manifest = self.manifest(name)?;
            let options = &expansion.options[name];
            self.check_requirements(manifest, options)?;
        }

        let mut incoming: BTreeMap<&PackageName, Vec<DependencyKind>> = BTreeMap::new();
        for edges in expansion.edges.values() {
            for edge in edges {
                incoming.entry(&edge.to).or_default().push(edge.kind);
            }
        }

        let mut nodes = Vec::with_capacity(order.len());
        for name in &order {
            let manifest = self.manifest(name)?;
            let mode = self.selection.mode(name);
            let options = expansion.options[name].clone();
            let locator = manifest
                .locator(mode)
                .cloned()
                .ok_or_else(|| ResolutionError::Unsatisfiable {
                    name: name.clone(),
                    reason: format!("no {mode} source declared"),
                })?;
            let is_requested = requested.contains(name);
            let build_only = !is_requested
                && incoming
                    .get(name)
                    .is_some_and(|kinds| kinds.iter().all(|k| *k == DependencyKind::Build));

            tracing::debug!(
                name = %name,
                mode = %mode,
                options = ?options.enabled().collect::<Vec<_>>(),
                build_only,
                "resolved node"
            );

            nodes.push(PlanNode {
                version: manifest.version_for(mode),
                fingerprint: options.fingerprint(mode),
                edges: expansion.edges[name].clone(),
                manifest: manifest.clone(),
                locator,
                mode,
                options,
                build_only,
                requested: is_requested,
            });
        }

        Ok(BuildPlan {
            nodes,
            environment: self.env.clone(),
        })
    }

    fn manifest(&self, name: &PackageName) -> Result<&'a Manifest, ResolutionError> {
        self.manifests
            .get(name)
            .ok_or_else(|| ResolutionError::UnknownPackage {
                name: name.clone(),
                required_by: None,
            })
    }

    /// Defaults, then user overrides, then sub-options demanded by dependents.
    fn active_options(
        &self,
        manifest: &Manifest,
        demanded: Option<&BTreeMap<String, PackageName>>,
    ) -> Result<ActiveOptions, ResolutionError> {
        let name = &manifest.name;
        let unsatisfiable = |reason: String| ResolutionError::Unsatisfiable {
            name: name.clone(),
            reason,
        };

        let mut options = manifest.default_options();
        for (option, enabled) in self.selection.overrides(name) {
            if !manifest.declares_option(option) {
                return Err(unsatisfiable(format!("unknown option '{option}'")));
            }
            options.set(option, enabled);
        }

        for (option, by) in demanded.into_iter().flatten() {
            if !manifest.declares_option(option) {
                return Err(unsatisfiable(format!(
                    "{by} requires option '{option}', which is not declared"
                )));
            }
            if self.selection.explicit(name, option) == Some(false) {
                return Err(unsatisfiable(format!(
                    "{by} requires option '{option}', which was explicitly disabled"
                )));
            }
            options.set(option.clone(), true);
        }
        Ok(options)
    }

    /// Walk active edges from the targets. Returns the expansion and the
    /// sub-options its edges demand.
    fn expand(
        &self,
        targets: &BTreeSet<PackageName>,
        demands: &Demands,
    ) -> Result<(Expansion, Demands), ResolutionError> {
        let mut options: BTreeMap<PackageName, ActiveOptions> = BTreeMap::new();
        let mut edges: BTreeMap<PackageName, Vec<PlanEdge>> = BTreeMap::new();
        let mut found = Demands::new();
        let mut queue = targets.clone();

        while let Some(name) = queue.pop_first() {
            if options.contains_key(&name) {
                continue;
            }
            let manifest = self.manifest(&name)?;
            let active = self.active_options(manifest, demands.get(&name))?;
            let ctx = EvalContext {
                options: &active,
                mode: self.selection.mode(&name),
                env: self.env,
            };

            let mut out = Vec::new();
            for dep in &manifest.dependencies {
                if !dep.kind.orders_build() || !Manifest::edge_active(dep, &ctx) {
                    continue;
                }
                if !self.manifests.contains(&dep.name) {
                    return Err(ResolutionError::UnknownPackage {
                        name: dep.name.clone(),
                        required_by: Some(name.clone()),
                    });
                }
                for option in &dep.options {
                    found
                        .entry(dep.name.clone())
                        .or_default()
                        .entry(option.clone())
                        .or_insert_with(|| name.clone());
                }
                if !options.contains_key(&dep.name) {
                    queue.insert(dep.name.clone());
                }
                out.push(PlanEdge {
                    to: dep.name.clone(),
                    kind: dep.kind,
                });
            }
            out.sort_by(|a, b| a.to.cmp(&b.to));

            edges.insert(name.clone(), out);
            options.insert(name, active);
        }

        Ok((Expansion { options, edges }, found))
    }

    /// Conflicts are symmetric: it is enough for either side to declare one.
    fn check_conflicts(&self, expansion: &Expansion) -> Result<(), ResolutionError> {
        let names: Vec<&PackageName> = expansion.options.keys().collect();
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                let declared = self
                    .declared_conflict(a, b, expansion)
                    .or_else(|| self.declared_conflict(b, a, expansion));
                if let Some(because) = declared {
                    return Err(ResolutionError::Conflict {
                        a: (*a).clone(),
                        b: (*b).clone(),
                        because,
                    });
                }
            }
        }
        Ok(())
    }

    /// `Some(because)` when `from` declares an active conflict with `other`.
    fn declared_conflict(
        &self,
        from: &PackageName,
        other: &PackageName,
        expansion: &Expansion,
    ) -> Option<Option<String>> {
        let manifest = self.manifests.get(from)?;
        let decl = manifest.conflict_with(other)?;
        let ctx = EvalContext {
            options: &expansion.options[from],
            mode: self.selection.mode(from),
            env: self.env,
        };
        condition::holds(decl.when.as_ref(), &ctx).then(|| decl.because.clone())
    }

    /// All requirements and compiler declarations must hold.
    fn check_requirements(
        &self,
        manifest: &Manifest,
        options: &ActiveOptions,
    ) -> Result<(), ResolutionError> {
        let ctx = EvalContext {
            options,
            mode: self.selection.mode(&manifest.name),
            env: self.env,
        };
        for requirement in &manifest.requirements {
            if !condition::holds(requirement.when.as_ref(), &ctx) {
                continue;
            }
            requirement
                .check(self.env)
                .map_err(|reason| ResolutionError::Unsatisfiable {
                    name: manifest.name.clone(),
                    reason,
                })?;
        }
        if let Some(failure) = manifest.fails_with.iter().find(|f| f.affects(self.env)) {
            let build = failure
                .build
                .map(|b| format!(" (build {b} and older)"))
                .unwrap_or_default();
            return Err(ResolutionError::Unsatisfiable {
                name: manifest.name.clone(),
                reason: format!(
                    "fails with {}{build}: {}",
                    failure.compiler, failure.cause
                ),
            });
        }
        Ok(())
    }
}

/// Depth-first search with recursion-stack marking.
///
/// Returns the first cycle found, starting and ending with the same name.
fn find_cycle(edges: &BTreeMap<PackageName, Vec<PlanEdge>>) -> Option<Vec<PackageName>> {
    let mut visited = HashSet::new();
    let mut stack = Vec::new();

    for start in edges.keys() {
        if let Some(cycle) = visit(start, edges, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    name: &'a PackageName,
    edges: &'a BTreeMap<PackageName, Vec<PlanEdge>>,
    visited: &mut HashSet<&'a PackageName>,
    stack: &mut Vec<&'a PackageName>,
) -> Option<Vec<PackageName>> {
    if let Some(idx) = stack.iter().position(|n| *n == name) {
        let mut path: Vec<PackageName> = stack[idx..].iter().map(|n| (*n).clone()).collect();
        path.push(name.clone());
        return Some(path);
    }
    if !visited.insert(name) {
        return None;
    }

    stack.push(name);
    for edge in edges.get(name).into_iter().flatten() {
        if let Some(cycle) = visit(&edge.to, edges, visited, stack) {
            return Some(cycle);
        }
    }
    stack.pop();
    None
}

/// Kahn's algorithm with a name-ordered ready set.
fn topological_order(
    edges: &BTreeMap<PackageName, Vec<PlanEdge>>,
) -> Result<Vec<PackageName>, ResolutionError> {
    let mut pending: BTreeMap<&PackageName, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&PackageName, Vec<&PackageName>> = BTreeMap::new();
    for (name, out) in edges {
        pending.insert(name, out.len());
        for edge in out {
            dependents.entry(&edge.to).or_default().push(name);
        }
    }

    let mut ready: BTreeSet<&PackageName> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.clone());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() < edges.len() {
        let stuck = pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(name, _)| name.clone())
            .collect();
        return Err(ResolutionError::Cycle { path: stuck });
    }
    Ok(order)
}
