use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::write::GzEncoder;
use mash_core::host;
use mash_core::{
    BuildPlan, Config, Executor, FetchError, ManifestSet, NodeFailure, NullReporter,
    OptionSelection, Outcome, SourceFetcher, resolve,
};
use mash_schema::{BuildMode, Manifest, PackageName};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A throwaway mash home plus a directory of source tarballs.
struct Fixture {
    _root: TempDir,
    config: Config,
    sources: PathBuf,
    manifests: Vec<Manifest>,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().expect("failed to create temp dir");
        let mut config = Config::with_home(root.path().join("home"));
        config.jobs = 4;
        let sources = root.path().join("sources");
        std::fs::create_dir_all(&sources).unwrap();
        Self {
            _root: root,
            config,
            sources,
            manifests: Vec::new(),
        }
    }

    /// Write `<name>-1.0.tar.gz` holding one script and return (url, sha256).
    fn tarball(&self, name: &str) -> (String, String) {
        let path = self.sources.join(format!("{name}-1.0.tar.gz"));
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let body = format!("#!/bin/sh\necho {name}\n");
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{name}-1.0/{name}.sh"), body.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let sha = hex::encode(Sha256::digest(std::fs::read(&path).unwrap()));
        (Url::from_file_path(&path).unwrap().to_string(), sha)
    }

    /// Add a formula installing its script into `bin`, with extra TOML appended.
    fn formula(&mut self, name: &str, extra: &str) {
        let (url, sha) = self.tarball(name);
        let text = format!(
            "[package]\nname = \"{name}\"\nversion = \"1.0\"\n\
             [source]\nurl = \"{url}\"\nsha256 = \"{sha}\"\n\
             [[steps]]\nmkdir = \"{{bin}}\"\n\
             [[steps]]\ninstall = \"{name}.sh\"\ninto = \"{{bin}}\"\n{extra}"
        );
        self.manifests.push(Manifest::load(&text).unwrap());
    }

    fn plan(&self, targets: &[&str]) -> BuildPlan {
        self.plan_with(targets, &OptionSelection::new())
    }

    fn plan_with(&self, targets: &[&str], selection: &OptionSelection) -> BuildPlan {
        let set = ManifestSet::from_manifests(self.manifests.clone()).unwrap();
        let targets: Vec<PackageName> = targets.iter().map(|t| PackageName::new(t)).collect();
        resolve(&set, &targets, selection, &host::detect()).unwrap()
    }

    fn executor(&self) -> Executor {
        let fetcher = SourceFetcher::new(reqwest::Client::new(), self.config.layout.download_cache());
        Executor::new(&self.config, Arc::new(fetcher), Arc::new(NullReporter))
    }
}

fn dep(name: &str, kind: &str) -> String {
    format!("[[dependencies]]\nname = \"{name}\"\nkind = \"{kind}\"\n")
}

fn names(list: &[PackageName]) -> Vec<&str> {
    list.iter().map(PackageName::as_str).collect()
}

fn opt_script(fixture: &Fixture, name: &str) -> PathBuf {
    fixture
        .config
        .layout
        .opt_link(&name.into())
        .join("bin")
        .join(format!("{name}.sh"))
}

fn corrupt(path: &Path) {
    std::fs::write(path, b"not a bottle").unwrap();
}

#[tokio::test]
async fn builds_in_order_and_caches_runtime_kegs() {
    let mut fx = Fixture::new();
    fx.formula("a", &dep("b", "required"));
    fx.formula("b", &dep("c", "build"));
    fx.formula("c", "");
    let plan = fx.plan(&["a"]);
    assert_eq!(
        plan.order().iter().map(|n| n.as_str()).collect::<Vec<_>>(),
        vec!["c", "b", "a"]
    );

    let executor = fx.executor();
    let report = executor.execute(&plan, &CancellationToken::new()).await;

    assert_eq!(report.outcome, Outcome::Success, "{report:?}");
    assert_eq!(names(&report.built), vec!["c", "b", "a"]);
    assert_eq!(names(&report.discarded), vec!["c"]);
    assert!(opt_script(&fx, "a").is_file());
    assert!(opt_script(&fx, "b").is_file());
    assert!(!fx.config.layout.opt_link(&"c".into()).exists());

    let cached: Vec<String> = executor
        .cache()
        .list()
        .unwrap()
        .into_iter()
        .map(|e| e.key.name.to_string())
        .collect();
    assert_eq!(cached, vec!["a", "b"]);
}

#[tokio::test]
async fn second_execution_pours_bottles() {
    let mut fx = Fixture::new();
    fx.formula("a", &dep("b", "required"));
    fx.formula("b", "");
    let plan = fx.plan(&["a"]);
    let executor = fx.executor();

    let first = executor.execute(&plan, &CancellationToken::new()).await;
    assert!(first.is_success());
    assert_eq!(executor.builds(), 2);

    let reused = executor.execute(&plan, &CancellationToken::new()).await;
    assert_eq!(names(&reused.reused), vec!["b", "a"]);

    for name in ["a", "b"] {
        executor.kegs().uninstall(&name.into()).unwrap();
    }
    let poured = executor.execute(&plan, &CancellationToken::new()).await;
    assert!(poured.is_success());
    assert_eq!(names(&poured.from_cache), vec!["b", "a"]);
    assert_eq!(executor.builds(), 2);
    assert!(poured.kegs[&PackageName::new("a")].receipt.from_bottle);
    assert!(opt_script(&fx, "a").is_file());
}

#[tokio::test]
async fn build_dependencies_are_skipped_when_dependents_pour() {
    let mut fx = Fixture::new();
    fx.formula("app", &dep("gen", "build"));
    fx.formula("gen", &dep("m4", "required"));
    fx.formula("m4", "");
    let plan = fx.plan(&["app"]);
    let executor = fx.executor();

    let first = executor.execute(&plan, &CancellationToken::new()).await;
    assert!(first.is_success(), "{first:?}");
    assert_eq!(names(&first.built), vec!["m4", "gen", "app"]);
    assert!(first.unneeded.is_empty());

    assert_eq!(names(&first.discarded), vec!["gen"]);

    let reused = executor.execute(&plan, &CancellationToken::new()).await;
    assert_eq!(names(&reused.reused), vec!["app"]);
    assert_eq!(names(&reused.unneeded), vec!["m4", "gen"]);

    executor.kegs().uninstall(&"app".into()).unwrap();
    let poured = executor.execute(&plan, &CancellationToken::new()).await;
    assert_eq!(poured.outcome, Outcome::Success, "{poured:?}");
    assert_eq!(names(&poured.from_cache), vec!["app"]);
    assert_eq!(names(&poured.unneeded), vec!["m4", "gen"]);
    assert_eq!(executor.builds(), 3);
    assert!(!fx.config.layout.opt_link(&"gen".into()).exists());
}

#[tokio::test]
async fn tampered_bottle_is_rebuilt() {
    let mut fx = Fixture::new();
    fx.formula("solo", "");
    let plan = fx.plan(&["solo"]);
    let executor = fx.executor();

    assert!(executor.execute(&plan, &CancellationToken::new()).await.is_success());
    let entry = executor.cache().list().unwrap().remove(0);
    corrupt(
        &fx.config
            .layout
            .bottles()
            .join("blobs")
            .join(entry.sha256.as_str()),
    );
    assert_eq!(executor.cache().verify().unwrap().len(), 1);

    executor.kegs().uninstall(&"solo".into()).unwrap();
    let report = executor.execute(&plan, &CancellationToken::new()).await;
    assert_eq!(names(&report.built), vec!["solo"]);
    assert_eq!(executor.builds(), 2);
    assert!(executor.cache().verify().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_build_each_keg_once() {
    let mut fx = Fixture::new();
    fx.formula("top", &format!("{}{}", dep("left", "required"), dep("right", "required")));
    fx.formula("left", &dep("base", "required"));
    fx.formula("right", &dep("base", "required"));
    fx.formula("base", "");
    let plan = fx.plan(&["top"]);
    let executor = fx.executor();

    let runs = (0..4).map(|_| {
        let executor = executor.clone();
        let plan = plan.clone();
        tokio::spawn(async move { executor.execute(&plan, &CancellationToken::new()).await })
    });
    for report in futures::future::join_all(runs).await {
        assert!(report.unwrap().is_success());
    }
    assert_eq!(executor.builds(), plan.len());
    assert_eq!(executor.kegs().list().unwrap().len(), plan.len());
}

#[tokio::test]
async fn required_dependency_failure_aborts() {
    let mut fx = Fixture::new();
    fx.formula("app", &dep("broken", "required"));
    fx.formula("broken", "[[steps]]\nrun = [\"false\"]\n");
    let plan = fx.plan(&["app"]);

    let report = fx.executor().execute(&plan, &CancellationToken::new()).await;
    assert_eq!(report.outcome, Outcome::Failed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name.as_str(), "broken");
    assert_eq!(names(&report.not_started), vec!["app"]);
    assert!(fx.executor().kegs().list().unwrap().is_empty());
    // The failed build's log is kept for inspection
    assert!(
        std::fs::read_dir(fx.config.layout.log_dir())
            .map(|d| d.count() > 0)
            .unwrap_or(false)
    );
}

#[tokio::test]
async fn recommended_dependency_failure_prunes_dependents() {
    let mut fx = Fixture::new();
    fx.formula("viewer", &dep("broken", "recommended"));
    fx.formula("broken", "[[steps]]\nrun = [\"false\"]\n");
    fx.formula("other", "");
    let plan = fx.plan(&["viewer", "other"]);

    let report = fx.executor().execute(&plan, &CancellationToken::new()).await;
    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(names(&report.skipped), vec!["viewer"]);
    assert_eq!(names(&report.built), vec!["other"]);
}

#[tokio::test]
async fn checksum_mismatch_fails_the_node() {
    let mut server = mockito::Server::new_async().await;
    let _tarball = server
        .mock("GET", "/evil-1.0.tar.gz")
        .with_status(200)
        .with_body("tampered")
        .create_async()
        .await;

    let mut fx = Fixture::new();
    let text = format!(
        "[package]\nname = \"evil\"\nversion = \"1.0\"\n\
         [source]\nurl = \"{}/evil-1.0.tar.gz\"\nsha256 = \"{}\"\n\
         [[steps]]\nmkdir = \"{{bin}}\"\n",
        server.url(),
        "0".repeat(64)
    );
    fx.manifests.push(Manifest::load(&text).unwrap());
    let plan = fx.plan(&["evil"]);

    let report = fx.executor().execute(&plan, &CancellationToken::new()).await;
    assert_eq!(report.outcome, Outcome::Failed);
    assert!(matches!(
        report.failures[0].source,
        NodeFailure::Fetch(FetchError::ChecksumMismatch { .. })
    ));
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let mut fx = Fixture::new();
    fx.formula("idle", "");
    let plan = fx.plan(&["idle"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let executor = fx.executor();
    let report = executor.execute(&plan, &cancel).await;
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(names(&report.not_started), vec!["idle"]);
    assert_eq!(executor.builds(), 0);
}

#[tokio::test]
async fn cancellation_stops_running_builds() {
    let mut fx = Fixture::new();
    fx.formula("slow", "[[steps]]\nrun = [\"sleep\", \"30\"]\n");
    let plan = fx.plan(&["slow"]);
    let executor = fx.executor();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = executor.execute(&plan, &cancel).await;
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(executor.kegs().list().unwrap().is_empty());
    assert_eq!(
        std::fs::read_dir(fx.config.layout.tmp()).unwrap().count(),
        0,
        "working directory should be cleaned up"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_one_execution_leaves_waiting_ones_running() {
    let mut fx = Fixture::new();
    fx.formula("slow", "[[steps]]\nrun = [\"sleep\", \"2\"]\n");
    let plan = fx.plan(&["slow"]);
    let executor = fx.executor();

    let first_cancel = CancellationToken::new();
    let first = {
        let executor = executor.clone();
        let plan = plan.clone();
        let cancel = first_cancel.clone();
        tokio::spawn(async move { executor.execute(&plan, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Joins the build the first execution is running
    let second = {
        let executor = executor.clone();
        let plan = plan.clone();
        tokio::spawn(async move { executor.execute(&plan, &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    first_cancel.cancel();

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.outcome, Outcome::Cancelled);
    assert_eq!(second.outcome, Outcome::Success, "{second:?}");
    assert_eq!(names(&second.built), vec!["slow"]);
    assert_eq!(executor.builds(), 2);
    assert!(opt_script(&fx, "slow").is_file());
}

#[tokio::test]
async fn head_builds_follow_upstream_commits() {
    if which::which("git").is_err() {
        return;
    }
    let mut fx = Fixture::new();
    let repo = fx.sources.join("h.git");
    std::fs::create_dir_all(&repo).unwrap();
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
    let commit = |body: &str| {
        std::fs::write(repo.join("h.sh"), body).unwrap();
        git(&["add", "h.sh"]);
        git(&["commit", "--quiet", "-m", body]);
    };
    git(&["init", "--quiet"]);
    commit("v1");

    let head = format!("[head]\nurl = \"file://{}\"\nusing = \"git\"\n", repo.display());
    fx.formula("h", &head);
    let mut selection = OptionSelection::new();
    selection.set_mode(&"h".into(), BuildMode::Head);
    let plan = fx.plan_with(&["h"], &selection);
    let executor = fx.executor();

    let first = executor.execute(&plan, &CancellationToken::new()).await;
    assert_eq!(first.outcome, Outcome::Success, "{first:?}");
    assert_eq!(std::fs::read_to_string(opt_script(&fx, "h")).unwrap(), "v1");
    assert!(executor.cache().list().unwrap().is_empty());

    commit("v2");
    let second = executor.execute(&plan, &CancellationToken::new()).await;
    assert_eq!(second.outcome, Outcome::Success, "{second:?}");
    assert_eq!(names(&second.built), vec!["h"]);
    assert!(second.from_cache.is_empty() && second.reused.is_empty());
    assert_eq!(std::fs::read_to_string(opt_script(&fx, "h")).unwrap(), "v2");
    assert_eq!(executor.kegs().list().unwrap().len(), 1);
}
