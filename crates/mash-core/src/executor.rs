//! Plan execution.
//!
//! Nodes run on a bounded worker pool in dependency order. For each node
//! the executor reuses an identical installed keg, else materializes a
//! bottle from the cache, else builds from source in a scoped working
//! directory. Concurrent executions share work through a [`Coalescer`]
//! keyed by keg identity, so a keg is built at most once at a time.
//!
//! A failure stops new nodes from starting unless every dependent of the
//! failed node reaches it only through optional or recommended edges; then
//! those dependents (and anything depending on them) are pruned and the
//! rest of the plan continues.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use mash_schema::{BuildMode, DependencyKind, PackageName};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::builder::{self, BuildContext};
use crate::cache::{BottleCache, CacheKey};
use crate::coalesce::Coalescer;
use crate::config::Config;
use crate::error::{BuildError, NodeError, NodeFailure};
use crate::fetch::Fetcher;
use crate::keg::{Keg, KegReceipt, KegStore};
use crate::paths::Layout;
use crate::plan::{BuildPlan, PlanNode};
use crate::reporter::Reporter;
use crate::workdir::WorkDir;

/// How a node's keg came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Built from source.
    Built,
    /// Unpacked from the bottle cache.
    Cached,
    /// An identical keg was already installed.
    Reused,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Built => "built",
            Self::Cached => "poured from cache",
            Self::Reused => "already installed",
        })
    }
}

/// Result of one successful node.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    /// The keg now linked at `opt/<name>`.
    pub keg: Keg,
    /// Where it came from.
    pub origin: Origin,
}

type NodeResult = Result<NodeOutcome, Arc<NodeError>>;

/// Overall result of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every node succeeded.
    Success,
    /// Some nodes failed or were pruned, but only through optional edges.
    Partial,
    /// A failure aborted the plan.
    Failed,
    /// The execution was cancelled.
    Cancelled,
}

/// What happened during [`Executor::execute`].
#[derive(Debug)]
pub struct ExecutionReport {
    /// Overall outcome.
    pub outcome: Outcome,
    /// Nodes built from source, in completion order.
    pub built: Vec<PackageName>,
    /// Nodes poured from the bottle cache.
    pub from_cache: Vec<PackageName>,
    /// Nodes whose keg was already installed.
    pub reused: Vec<PackageName>,
    /// Nodes pruned because an optional dependency failed.
    pub skipped: Vec<PackageName>,
    /// Nodes that never started because the plan was aborted or cancelled.
    pub not_started: Vec<PackageName>,
    /// Nodes not run because only builds needed them and those dependents
    /// were already installed or in the bottle cache.
    pub unneeded: Vec<PackageName>,
    /// Build-only kegs removed at the end.
    pub discarded: Vec<PackageName>,
    /// Per-node failures.
    pub failures: Vec<Arc<NodeError>>,
    /// Kegs of every successful node.
    pub kegs: BTreeMap<PackageName, Keg>,
}

impl ExecutionReport {
    fn new() -> Self {
        Self {
            outcome: Outcome::Success,
            built: Vec::new(),
            from_cache: Vec::new(),
            reused: Vec::new(),
            skipped: Vec::new(),
            not_started: Vec::new(),
            unneeded: Vec::new(),
            discarded: Vec::new(),
            failures: Vec::new(),
            kegs: BTreeMap::new(),
        }
    }

    /// Whether every node succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

struct Inner {
    layout: Layout,
    kegs: KegStore,
    cache: BottleCache,
    fetcher: Arc<dyn Fetcher>,
    reporter: Arc<dyn Reporter>,
    coalescer: Coalescer<NodeResult>,
    jobs: usize,
    build_jobs: usize,
    keep_build_deps: bool,
    builds: AtomicUsize,
}

/// Executes build plans. Cheap to clone; clones share the coalescer, so
/// concurrent executions through clones never build the same keg twice.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("home", &self.inner.layout.home())
            .field("jobs", &self.inner.jobs)
            .field("keep_build_deps", &self.inner.keep_build_deps)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Executor for `config`, fetching through `fetcher`.
    pub fn new(config: &Config, fetcher: Arc<dyn Fetcher>, reporter: Arc<dyn Reporter>) -> Self {
        let layout = config.layout.clone();
        Self {
            inner: Arc::new(Inner {
                kegs: KegStore::new(layout.clone()),
                cache: BottleCache::new(layout.bottles()),
                layout,
                fetcher,
                reporter,
                coalescer: Coalescer::new(),
                jobs: config.jobs.max(1),
                build_jobs: num_cpus::get(),
                keep_build_deps: config.keep_build_deps,
                builds: AtomicUsize::new(0),
            }),
        }
    }

    /// The keg store this executor installs into.
    pub fn kegs(&self) -> &KegStore {
        &self.inner.kegs
    }

    /// The bottle cache this executor consults.
    pub fn cache(&self) -> &BottleCache {
        &self.inner.cache
    }

    /// Number of source builds started by this executor (and its clones).
    pub fn builds(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    /// Execute `plan`.
    ///
    /// Never returns an error: per-node failures, pruning and cancellation
    /// are all described by the returned report.
    pub async fn execute(&self, plan: &BuildPlan, cancel: &CancellationToken) -> ExecutionReport {
        let plan = Arc::new(plan.clone());
        let semaphore = Arc::new(Semaphore::new(self.inner.jobs));
        let mut report = ExecutionReport::new();

        let index: HashMap<&PackageName, usize> = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name(), i))
            .collect();
        let mut waiting_on: Vec<usize> = plan.nodes.iter().map(|n| n.edges.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.len()];
        for (i, node) in plan.nodes.iter().enumerate() {
            for dep in node.dependencies() {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }

        let mut finished: BTreeSet<usize> = BTreeSet::new();
        for i in self.unneeded_build_deps(&plan, &dependents).await {
            let node = &plan.nodes[i];
            tracing::info!(package = %node.name(), "build dependency not needed, dependents are prebuilt");
            self.inner
                .reporter
                .skipped(node.name(), "not needed, dependents are prebuilt");
            report.unneeded.push(node.name().clone());
            finished.insert(i);
            for &d in &dependents[i] {
                waiting_on[d] -= 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..plan.len())
            .filter(|&i| waiting_on[i] == 0 && !finished.contains(&i))
            .collect();
        let mut tasks: JoinSet<(usize, NodeResult)> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut aborted = false;

        self.inner.reporter.section("Building");

        loop {
            if cancel.is_cancelled() {
                report.outcome = Outcome::Cancelled;
            }
            let accepting = !aborted && report.outcome != Outcome::Cancelled;
            while accepting && let Some(i) = ready.pop_first() {
                let inner = Arc::clone(&self.inner);
                let plan = Arc::clone(&plan);
                let cancel = cancel.clone();
                let semaphore = Arc::clone(&semaphore);
                let handle = tasks.spawn(async move {
                    let result = run_node(&inner, &plan, i, &cancel, &semaphore).await;
                    (i, result)
                });
                running.insert(handle.id(), i);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (i, result) = match joined {
                Ok((id, pair)) => {
                    running.remove(&id);
                    pair
                }
                Err(join_error) => {
                    let Some(i) = running.remove(&join_error.id()) else {
                        continue;
                    };
                    let name = plan.nodes[i].name().clone();
                    let failure = BuildError::Io {
                        context: "build task panicked".to_string(),
                        source: std::io::Error::other(join_error.to_string()),
                    };
                    (i, Err(Arc::new(NodeError::new(name, failure))))
                }
            };
            finished.insert(i);
            let node = &plan.nodes[i];

            match result {
                Ok(outcome) => {
                    self.inner
                        .reporter
                        .done(node.name(), &node.version, &outcome.origin.to_string());
                    match outcome.origin {
                        Origin::Built => report.built.push(node.name().clone()),
                        Origin::Cached => report.from_cache.push(node.name().clone()),
                        Origin::Reused => report.reused.push(node.name().clone()),
                    }
                    report.kegs.insert(node.name().clone(), outcome.keg);

                    for &d in &dependents[i] {
                        waiting_on[d] -= 1;
                        if waiting_on[d] == 0 && !finished.contains(&d) {
                            ready.insert(d);
                        }
                    }
                }
                Err(error) if error.source.is_cancelled() => {
                    report.outcome = Outcome::Cancelled;
                }
                Err(error) => {
                    tracing::error!(package = %node.name(), error = %error, "node failed");
                    self.inner
                        .reporter
                        .failed(node.name(), &node.version, &error.source.to_string());
                    report.failures.push(error);

                    let soft = !dependents[i].is_empty()
                        && plan.dependents(node.name()).all(|(_, kind)| kind.is_optional());
                    if soft {
                        for pruned in prune(&dependents, i, &mut finished) {
                            let name = plan.nodes[pruned].name();
                            ready.remove(&pruned);
                            self.inner
                                .reporter
                                .skipped(name, &format!("optional dependency {} failed", node.name()));
                            report.skipped.push(name.clone());
                        }
                    } else {
                        aborted = true;
                    }
                }
            }
        }

        report.not_started = (0..plan.len())
            .filter(|i| !finished.contains(i))
            .map(|i| plan.nodes[i].name().clone())
            .collect();

        if report.outcome != Outcome::Cancelled {
            report.outcome = if aborted {
                Outcome::Failed
            } else if report.failures.is_empty() && report.skipped.is_empty() {
                Outcome::Success
            } else {
                Outcome::Partial
            };
        }

        if !self.inner.keep_build_deps {
            self.discard_build_only(&plan, &mut report);
        }

        tracing::info!(
            outcome = ?report.outcome,
            built = report.built.len(),
            from_cache = report.from_cache.len(),
            reused = report.reused.len(),
            failed = report.failures.len(),
            "execution finished"
        );
        report
    }

    /// Nodes that no build in this plan needs.
    ///
    /// A node qualifies when every dependent either qualifies itself or is
    /// prebuilt (installed keg or verified bottle) and reaches it through a
    /// build edge. Plans are in dependency order, so walking backwards
    /// settles dependents first.
    async fn unneeded_build_deps(
        &self,
        plan: &Arc<BuildPlan>,
        dependents: &[Vec<usize>],
    ) -> BTreeSet<usize> {
        let inner = Arc::clone(&self.inner);
        let plan = Arc::clone(plan);
        let dependents = dependents.to_vec();
        let scan = tokio::task::spawn_blocking(move || {
            let mut prebuilt: HashMap<usize, bool> = HashMap::new();
            let mut unneeded = BTreeSet::new();
            for i in (0..plan.len()).rev() {
                let node = &plan.nodes[i];
                if node.requested || dependents[i].is_empty() {
                    continue;
                }
                let satisfied = dependents[i].iter().all(|&d| {
                    let dependent = &plan.nodes[d];
                    let build_edge = dependent
                        .edges
                        .iter()
                        .any(|e| e.to == *node.name() && e.kind == DependencyKind::Build);
                    unneeded.contains(&d)
                        || (build_edge
                            && *prebuilt
                                .entry(d)
                                .or_insert_with(|| is_prebuilt(&inner, &plan, dependent)))
                });
                if satisfied {
                    unneeded.insert(i);
                }
            }
            unneeded
        });
        scan.await.unwrap_or_default()
    }

    /// Remove build-only kegs created during this execution.
    fn discard_build_only(&self, plan: &BuildPlan, report: &mut ExecutionReport) {
        let created: BTreeSet<&PackageName> =
            report.built.iter().chain(&report.from_cache).collect();
        let mut discarded = Vec::new();
        for node in plan.nodes.iter().filter(|n| n.build_only) {
            if !created.contains(node.name()) {
                continue;
            }
            let Some(keg) = report.kegs.remove(node.name()) else {
                continue;
            };
            match self.inner.kegs.remove(&keg) {
                Ok(()) => discarded.push(node.name().clone()),
                Err(e) => {
                    tracing::warn!(package = %node.name(), error = %e, "failed to discard build-only keg");
                    report.kegs.insert(node.name().clone(), keg);
                }
            }
        }
        report.discarded = discarded;
    }
}

/// Whether `node` will be reused or poured rather than built.
fn is_prebuilt(inner: &Inner, plan: &BuildPlan, node: &PlanNode) -> bool {
    if node.mode == BuildMode::Head {
        return false;
    }
    inner
        .kegs
        .find(node.name(), &node.version, &node.fingerprint)
        .is_some()
        || inner
            .cache
            .get(&CacheKey::for_node(node, &plan.environment))
            .is_some()
}

/// Mark every transitive dependent of `failed` as finished, returning them.
fn prune(dependents: &[Vec<usize>], failed: usize, finished: &mut BTreeSet<usize>) -> Vec<usize> {
    let mut pruned = Vec::new();
    let mut stack = dependents[failed].clone();
    while let Some(i) = stack.pop() {
        if finished.insert(i) {
            pruned.push(i);
            stack.extend(&dependents[i]);
        }
    }
    pruned.sort_unstable();
    pruned
}

async fn run_node(
    inner: &Arc<Inner>,
    plan: &BuildPlan,
    i: usize,
    cancel: &CancellationToken,
    semaphore: &Semaphore,
) -> NodeResult {
    let node = &plan.nodes[i];
    let cancelled = || Arc::new(NodeError::new(node.name().clone(), BuildError::Cancelled));

    let _permit = tokio::select! {
        permit = semaphore.acquire() => permit.map_err(|_| cancelled())?,
        () = cancel.cancelled() => return Err(cancelled()),
    };

    let key = format!("{}/{}/{}", node.name(), node.version, node.fingerprint);
    inner
        .coalescer
        .run_or_retry(
            &key,
            || async {
                materialize(inner, plan, node, cancel)
                    .await
                    .map_err(|failure| Arc::new(NodeError::new(node.name().clone(), failure)))
            },
            // Another execution's cancellation is not ours to report
            |result| matches!(result, Err(error) if error.source.is_cancelled()),
        )
        .await
}

/// Produce the keg of `node`: reuse, pour from cache, or build.
async fn materialize(
    inner: &Arc<Inner>,
    plan: &BuildPlan,
    node: &PlanNode,
    cancel: &CancellationToken,
) -> Result<NodeOutcome, NodeFailure> {
    let name = node.name();
    // HEAD follows upstream, so its keg identity never proves freshness
    let head = node.mode == BuildMode::Head;

    if !head
        && let Some(keg) = inner.kegs.find(name, &node.version, &node.fingerprint)
    {
        inner.kegs.link(&keg).map_err(BuildError::io("link opt"))?;
        tracing::info!(package = %name, "reusing installed keg");
        return Ok(NodeOutcome {
            keg,
            origin: Origin::Reused,
        });
    }

    let workdir = WorkDir::new(&inner.layout.tmp(), name).map_err(BuildError::io("create working directory"))?;
    let cache_key = CacheKey::for_node(node, &plan.environment);

    let cache = inner.cache.clone();
    let lookup_key = cache_key.clone();
    let prefix = workdir.prefix();
    let poured = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        let artifact = if head { None } else { cache.get(&lookup_key) };
        let Some(artifact) = artifact else {
            return Ok(false);
        };
        match artifact.unpack(&prefix) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(key = %lookup_key, error = %e, "failed to unpack bottle, building instead");
                // Drop whatever the unpack left behind
                std::fs::remove_dir_all(&prefix)?;
                std::fs::create_dir_all(&prefix)?;
                Ok(false)
            }
        }
    })
    .await
    .map_err(|e| BuildError::io("pour bottle")(std::io::Error::other(e)))?
    .map_err(BuildError::io("reset staging prefix"))?;

    let origin = if poured {
        tracing::info!(package = %name, "pouring bottle");
        Origin::Cached
    } else {
        inner.builds.fetch_add(1, Ordering::SeqCst);
        tracing::info!(package = %name, version = %node.version, "building from source");
        let dependencies = plan.environment_dependencies(name);
        let ctx = BuildContext {
            node,
            environment: &plan.environment,
            layout: &inner.layout,
            dependencies: &dependencies,
            fetcher: inner.fetcher.as_ref(),
            reporter: inner.reporter.as_ref(),
            jobs: inner.build_jobs,
        };
        builder::build(&ctx, &workdir, cancel).await?;
        Origin::Built
    };

    if cancel.is_cancelled() {
        return Err(BuildError::Cancelled.into());
    }

    let receipt = KegReceipt {
        name: name.clone(),
        version: node.version.clone(),
        fingerprint: node.fingerprint.clone(),
        mode: node.mode,
        options: node.options.clone(),
        source: node.locator.url.clone(),
        platform: cache_key.platform.clone(),
        from_bottle: origin == Origin::Cached,
        installed_at: Utc::now(),
    };
    let kegs = inner.kegs.clone();
    let staging = workdir.prefix();
    let keg = tokio::task::spawn_blocking(move || kegs.install_from(&staging, receipt))
        .await
        .map_err(|e| BuildError::io("install keg")(std::io::Error::other(e)))?
        .map_err(BuildError::io("install keg"))?;

    // Build-only kegs are discarded afterwards and never cached; HEAD
    // builds are never bottled
    let cacheable =
        origin == Origin::Built && !head && (!node.build_only || inner.keep_build_deps);
    if cacheable {
        let cache = inner.cache.clone();
        let tree = keg.path.clone();
        let stored = tokio::task::spawn_blocking(move || cache.put(&cache_key, &tree)).await;
        match stored {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(package = %name, error = %e, "failed to cache bottle"),
            Err(e) => tracing::warn!(package = %name, error = %e, "cache task failed"),
        }
    }

    Ok(NodeOutcome { keg, origin })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_follows_transitive_dependents() {
        // 0 <- 1 <- 2, 0 <- 3
        let dependents = vec![vec![1, 3], vec![2], vec![], vec![]];
        let mut finished = BTreeSet::from([0]);
        let pruned = prune(&dependents, 0, &mut finished);
        assert_eq!(pruned, vec![1, 2, 3]);
        assert_eq!(finished.len(), 4);
    }

    #[test]
    fn origin_reads_naturally() {
        assert_eq!(Origin::Cached.to_string(), "poured from cache");
    }
}
