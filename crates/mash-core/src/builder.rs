//! Install procedure execution.
//!
//! Runs one plan node's patches and steps inside its [`WorkDir`] with a
//! sanitised environment: host variables are cleared and only the set
//! below is injected. Steps are argv vectors, never shell strings.
//!
//! ## Environment contract
//!
//! | Variable | Value |
//! |---|---|
//! | `PATH` | `opt/<dep>/bin` for each dependency, then system directories |
//! | `HOME` | The working directory root (prevents reading host dotfiles) |
//! | `TERM` | `dumb` |
//! | `LANG` | `en_US.UTF-8` |
//! | `CC` / `CXX` | Drivers of the target environment's compiler |
//! | `PREFIX` | Staging install prefix |
//! | `JOBS` / `MAKEFLAGS` | Logical CPU count, `-j<JOBS>` (`-j1` after `deparallelize`) |
//! | `MASH_PREFIX` | mash home |
//! | `MASH_OPTIONS` | Space-separated enabled options |
//! | `DEP_<NAME>` | `opt/<name>` of each dependency |
//! | `CFLAGS` / `CPPFLAGS` | `-I` flags for each dependency's `include/` |
//! | `LDFLAGS` | `-L` flags for each dependency's `lib/` |
//! | `CPATH`, `LIBRARY_PATH`, `PKG_CONFIG_PATH` | Colon-separated search paths |
//! | `SOURCE_DATE_EPOCH` | `0` |
//!
//! The `universal` option adds `-arch arm64 -arch x86_64` to the C and
//! linker flags. Dependency paths always go through the stable `opt/`
//! links, never through versioned keg directories.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use mash_schema::condition::{self, EvalContext};
use mash_schema::step::{self, Step, StepAction};
use mash_schema::{Environment, Os, PackageName, PatchSource};
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, NodeFailure};
use crate::fetch::{self, Fetcher};
use crate::paths::Layout;
use crate::plan::PlanNode;
use crate::reporter::Reporter;
use crate::workdir::WorkDir;

/// Fixed epoch for `SOURCE_DATE_EPOCH`.
const SOURCE_DATE_EPOCH: &str = "0";

/// Directories searched after dependency `bin/` directories.
const SYSTEM_PATH: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Lines of captured output attached to a failed step.
const FAILURE_TAIL_LINES: usize = 20;

/// Everything a node build needs from the executor.
pub struct BuildContext<'a> {
    /// The node being built.
    pub node: &'a PlanNode,
    /// Target environment the plan was resolved for.
    pub environment: &'a Environment,
    /// Filesystem layout (for `opt/` links and logs).
    pub layout: &'a Layout,
    /// Packages exposed in the build environment.
    pub dependencies: &'a [PackageName],
    /// Source and resource fetcher.
    pub fetcher: &'a dyn Fetcher,
    /// Progress sink.
    pub reporter: &'a dyn Reporter,
    /// Parallelism handed to build tools (`JOBS`, `MAKEFLAGS`).
    pub jobs: usize,
}

/// Fetch, patch and run the install procedure of `ctx.node` in `workdir`.
///
/// On success the staging prefix (`workdir.prefix()`) holds the installed
/// tree. Cancelling `cancel` kills the running process and returns
/// [`BuildError::Cancelled`].
///
/// # Errors
///
/// Returns the first fetch or step failure.
pub async fn build(
    ctx: &BuildContext<'_>,
    workdir: &WorkDir,
    cancel: &CancellationToken,
) -> Result<(), NodeFailure> {
    // Dropping the build future kills any child (`kill_on_drop`)
    tokio::select! {
        result = run_build(ctx, workdir) => result,
        () = cancel.cancelled() => Err(BuildError::Cancelled.into()),
    }
}

async fn run_build(ctx: &BuildContext<'_>, workdir: &WorkDir) -> Result<(), NodeFailure> {
    let node = ctx.node;
    let name = node.name();

    ctx.reporter.fetching(name, &node.version);
    fetch::fetch_tree(ctx.fetcher, &node.locator, &workdir.download(), &workdir.src()).await?;

    let mut runner = StepRunner::new(ctx, workdir);
    let result = runner.run_all().await;
    if result.is_err() {
        runner.preserve_log();
    }
    result?;

    let installed = fs::read_dir(workdir.prefix())
        .map_err(BuildError::io("read staging prefix"))?
        .next()
        .is_some();
    if !installed {
        return Err(BuildError::EmptyInstallation.into());
    }
    Ok(())
}

/// Mutable state carried across the steps of one build.
struct StepRunner<'a> {
    ctx: &'a BuildContext<'a>,
    workdir: &'a WorkDir,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
    jobs: usize,
    log: PathBuf,
}

impl<'a> StepRunner<'a> {
    fn new(ctx: &'a BuildContext<'a>, workdir: &'a WorkDir) -> Self {
        Self {
            env: base_environment(ctx, workdir),
            cwd: workdir.src(),
            jobs: ctx.jobs,
            log: workdir.path().join("build.log"),
            ctx,
            workdir,
        }
    }

    fn eval_context(&self) -> EvalContext<'a> {
        EvalContext {
            options: &self.ctx.node.options,
            mode: self.ctx.node.mode,
            env: self.ctx.environment,
        }
    }

    async fn run_all(&mut self) -> Result<(), NodeFailure> {
        let node = self.ctx.node;
        let name = node.name();

        for patch in &node.manifest.patches {
            if !condition::holds(patch.when.as_ref(), &self.eval_context()) {
                continue;
            }
            let patch_dir = self.workdir.download().join("patches");
            let file = match &patch.source {
                PatchSource::Remote(locator) => {
                    self.ctx.fetcher.fetch_file(locator, &patch_dir).await?
                }
                PatchSource::Inline(data) => {
                    fs::create_dir_all(&patch_dir).map_err(BuildError::io("create patch directory"))?;
                    let file = patch_dir.join(format!("{}.patch", patch.name));
                    fs::write(&file, data).map_err(BuildError::io("write inline patch"))?;
                    file
                }
            };
            let description = format!("patch -p{} {}", patch.strip, patch.name);
            self.ctx.reporter.step(name, &description);
            let argv = vec![
                "patch".to_string(),
                format!("-p{}", patch.strip),
                "-i".to_string(),
                path_string(&file),
            ];
            self.run_process(&description, &argv).await?;
        }

        self.ctx.reporter.building(name, &node.version);
        for step in &node.manifest.steps {
            if !condition::holds(step.when.as_ref(), &self.eval_context()) {
                tracing::debug!(package = %name, step = %step.describe(), "condition false, skipping");
                continue;
            }
            self.ctx.reporter.step(name, &step.describe());
            self.run_step(step).await?;
        }
        Ok(())
    }

    async fn run_step(&mut self, step: &Step) -> Result<(), NodeFailure> {
        let description = step.describe();
        tracing::debug!(package = %self.ctx.node.name(), step = %description, "running step");

        match &step.action {
            StepAction::Run { argv } => {
                let argv = argv
                    .iter()
                    .map(|arg| self.expand(&description, arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.run_process(&description, &argv).await?;
            }
            StepAction::Chdir(dir) => {
                let dir = self.resolve(&self.expand(&description, dir)?);
                if !dir.is_dir() {
                    return Err(BuildError::Io {
                        context: description,
                        source: io::Error::new(io::ErrorKind::NotFound, "no such directory"),
                    }
                    .into());
                }
                self.cwd = dir;
            }
            StepAction::Mkdir(dir) => {
                let dir = self.resolve(&self.expand(&description, dir)?);
                fs::create_dir_all(&dir).map_err(BuildError::io(description))?;
            }
            StepAction::SetEnv { var, value } => {
                let value = self.expand(&description, value)?;
                self.env.insert(var.clone(), value);
            }
            StepAction::AppendEnv {
                var,
                value,
                separator,
            } => {
                let value = self.expand(&description, value)?;
                let joined = match self.env.get(var) {
                    Some(old) if !old.is_empty() => format!("{old}{separator}{value}"),
                    _ => value,
                };
                self.env.insert(var.clone(), joined);
            }
            StepAction::PrependEnv {
                var,
                value,
                separator,
            } => {
                let value = self.expand(&description, value)?;
                let joined = match self.env.get(var) {
                    Some(old) if !old.is_empty() => format!("{value}{separator}{old}"),
                    _ => value,
                };
                self.env.insert(var.clone(), joined);
            }
            StepAction::UnsetEnv(var) => {
                self.env.remove(var);
            }
            StepAction::Deparallelize => {
                self.jobs = 1;
                self.env.insert("JOBS".to_string(), "1".to_string());
                self.env.insert("MAKEFLAGS".to_string(), "-j1".to_string());
            }
            StepAction::Inreplace {
                file,
                pattern,
                replacement,
            } => {
                let file = self.resolve(&self.expand(&description, file)?);
                let replacement = self.expand(&description, replacement)?;
                inreplace(&file, pattern, &replacement)?;
            }
            StepAction::Install { from, into, rename } => {
                let source = self.resolve(&self.expand(&description, from)?);
                let dest_dir = self.resolve(&self.expand(&description, into)?);
                let target_name = match rename {
                    Some(rename) => PathBuf::from(self.expand(&description, rename)?),
                    None => source.file_name().map(PathBuf::from).unwrap_or_default(),
                };
                install_path(&source, &dest_dir.join(target_name))
                    .map_err(BuildError::io(description))?;
            }
            StepAction::Stage { resource, into } => {
                let Some(resource) = self.ctx.node.manifest.resource(resource) else {
                    return Err(BuildError::Io {
                        context: description,
                        source: io::Error::new(io::ErrorKind::NotFound, "undeclared resource"),
                    }
                    .into());
                };
                let staged = self.workdir.resources().join(&resource.name);
                let download_dir = self.workdir.download().join("resources");
                fetch::fetch_tree(self.ctx.fetcher, &resource.source, &download_dir, &staged)
                    .await?;
                if let Some(into) = into {
                    let dest = self.resolve(&self.expand(&description, into)?);
                    fs::create_dir_all(&dest)
                        .and_then(|()| copy_dir_all(&staged, &dest))
                        .map_err(BuildError::io(description))?;
                }
            }
            StepAction::Warn(message) => {
                let message = self.expand(&description, message)?;
                tracing::warn!(package = %self.ctx.node.name(), "{message}");
                self.ctx
                    .reporter
                    .warning(&format!("{}: {message}", self.ctx.node.name()));
            }
        }
        Ok(())
    }

    fn expand(&self, description: &str, template: &str) -> Result<String, BuildError> {
        step::expand(template, |name| self.placeholder(name)).map_err(|source| {
            BuildError::Template {
                step: description.to_string(),
                source,
            }
        })
    }

    fn placeholder(&self, name: &str) -> Option<String> {
        if let Some(dep) = name.strip_prefix("opt:") {
            return Some(path_string(&self.ctx.layout.opt_link(&PackageName::new(dep))));
        }

        let node = self.ctx.node;
        let prefix = self.workdir.prefix();
        let path = match name {
            "prefix" => prefix,
            "bin" | "sbin" | "lib" | "libexec" | "include" | "share" | "etc" | "var" => {
                prefix.join(name)
            }
            "doc" => prefix.join("share/doc").join(node.name()),
            "info" => prefix.join("share/info"),
            "man" => prefix.join("share/man"),
            section if is_man_section(section) => prefix.join("share/man").join(section),
            "frameworks" => prefix.join("Frameworks"),
            "buildpath" => self.workdir.src(),
            "name" => return Some(node.name().to_string()),
            "version" => return Some(node.version.to_string()),
            "jobs" => return Some(self.jobs.to_string()),
            _ => return None,
        };
        Some(path_string(&path))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.cwd.join(path)
    }

    async fn run_process(&self, description: &str, argv: &[String]) -> Result<(), BuildError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(BuildError::Spawn {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty argv"),
            });
        };

        let executable = if program.contains('/') {
            self.resolve(program)
        } else {
            let search = self.env.get("PATH").cloned().unwrap_or_default();
            which::which_in(program, Some(search), &self.cwd).map_err(|e| BuildError::Spawn {
                program: program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, e.to_string()),
            })?
        };

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)
            .map_err(BuildError::io("open build log"))?;
        writeln!(log, "==> {description}").map_err(BuildError::io("write build log"))?;
        let stdout = log.try_clone().map_err(BuildError::io("open build log"))?;

        let mut child = Command::new(&executable)
            .args(args)
            .env_clear()
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildError::Spawn {
                program: program.clone(),
                source,
            })?;

        let status = child
            .wait()
            .await
            .map_err(BuildError::io(format!("wait for {program}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(BuildError::StepFailed {
                step: description.to_string(),
                exit_code: status.code(),
                output: read_last_lines(&self.log, FAILURE_TAIL_LINES).unwrap_or_default(),
            })
        }
    }

    /// Copy the build log out of the working directory before it is removed.
    fn preserve_log(&self) {
        if !self.log.exists() {
            return;
        }
        let node = self.ctx.node;
        let target = self.ctx.layout.build_log_path(node.name(), &node.version);
        let copied = target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::copy(&self.log, &target));
        match copied {
            Ok(_) => tracing::info!(log = %target.display(), "build log kept"),
            Err(e) => tracing::warn!(error = %e, "failed to keep build log"),
        }
    }
}

fn is_man_section(name: &str) -> bool {
    name.strip_prefix("man")
        .is_some_and(|n| matches!(n, "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8"))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The initial build environment of a node.
fn base_environment(ctx: &BuildContext<'_>, workdir: &WorkDir) -> BTreeMap<String, String> {
    let mut include_paths: Vec<String> = Vec::new();
    let mut library_paths: Vec<String> = Vec::new();
    let mut pkg_config_paths: Vec<String> = Vec::new();
    let mut cflags: Vec<String> = Vec::new();
    let mut ldflags: Vec<String> = Vec::new();
    let mut path_dirs: Vec<String> = Vec::new();
    let mut env = BTreeMap::new();

    for dep in ctx.dependencies {
        let root = ctx.layout.opt_link(dep);
        env.insert(format!("DEP_{}", dep.env_key()), path_string(&root));

        if root.join("bin").is_dir() {
            path_dirs.push(path_string(&root.join("bin")));
        }
        if root.join("include").is_dir() {
            let inc = path_string(&root.join("include"));
            cflags.push(format!("-I{inc}"));
            include_paths.push(inc);
        }
        if root.join("lib").is_dir() {
            let lib = path_string(&root.join("lib"));
            ldflags.push(format!("-L{lib}"));
            library_paths.push(lib);
        }
        for pc in ["lib/pkgconfig", "share/pkgconfig"] {
            if root.join(pc).is_dir() {
                pkg_config_paths.push(path_string(&root.join(pc)));
            }
        }
    }

    let xcode_clt = Path::new("/Library/Developer/CommandLineTools/usr/bin");
    if xcode_clt.is_dir() {
        path_dirs.push(path_string(xcode_clt));
    }
    path_dirs.extend(SYSTEM_PATH.iter().map(|d| (*d).to_string()));

    if ctx.node.options.is_enabled("universal") {
        let arch_flags = "-arch arm64 -arch x86_64".to_string();
        cflags.push(arch_flags.clone());
        ldflags.push(arch_flags);
    }

    let compiler = ctx.environment.compiler.kind;
    let enabled: Vec<&str> = ctx.node.options.enabled().collect();
    let fixed = [
        ("PATH", path_dirs.join(":")),
        ("HOME", path_string(workdir.path())),
        ("TERM", "dumb".to_string()),
        ("LANG", "en_US.UTF-8".to_string()),
        ("CC", compiler.cc().to_string()),
        ("CXX", compiler.cxx().to_string()),
        ("PREFIX", path_string(&workdir.prefix())),
        ("JOBS", ctx.jobs.to_string()),
        ("MAKEFLAGS", format!("-j{}", ctx.jobs)),
        ("MASH_PREFIX", path_string(ctx.layout.home())),
        ("MASH_OPTIONS", enabled.join(" ")),
        ("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH.to_string()),
    ];
    env.extend(fixed.into_iter().map(|(k, v)| (k.to_string(), v)));

    if ctx.environment.os == Os::MacOs {
        env.insert(
            "MACOSX_DEPLOYMENT_TARGET".to_string(),
            ctx.environment.os_version.to_string(),
        );
    }

    if !cflags.is_empty() {
        let flags = cflags.join(" ");
        env.insert("CFLAGS".to_string(), flags.clone());
        env.insert("CPPFLAGS".to_string(), flags);
    }
    if !ldflags.is_empty() {
        env.insert("LDFLAGS".to_string(), ldflags.join(" "));
    }
    if !include_paths.is_empty() {
        env.insert("CPATH".to_string(), include_paths.join(":"));
    }
    if !library_paths.is_empty() {
        env.insert("LIBRARY_PATH".to_string(), library_paths.join(":"));
    }
    if !pkg_config_paths.is_empty() {
        env.insert("PKG_CONFIG_PATH".to_string(), pkg_config_paths.join(":"));
    }

    env
}

fn inreplace(file: &Path, pattern: &str, replacement: &str) -> Result<(), BuildError> {
    let fail = |reason: String| BuildError::Inreplace {
        file: file.to_path_buf(),
        reason,
    };
    let re = Regex::new(pattern).map_err(|e| fail(e.to_string()))?;
    let content = fs::read_to_string(file).map_err(|e| fail(e.to_string()))?;
    if !re.is_match(&content) {
        return Err(fail(format!("/{pattern}/ matched nothing")));
    }
    let replaced = re.replace_all(&content, replacement);
    fs::write(file, replaced.as_bytes()).map_err(|e| fail(e.to_string()))
}

fn install_path(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if source.is_dir() {
        fs::create_dir_all(target)?;
        copy_dir_all(source, target)
    } else {
        fs::copy(source, target).map(|_| ())
    }
}

/// Walk the output directory and convert absolute symlinks that pointed into
/// the old install prefix to relative symlinks.
///
/// `make install` commonly creates absolute links into `$PREFIX`. Once the
/// staging prefix is moved into the cellar these would dangle, so each one
/// is rewritten relative to its own directory.
///
/// # Errors
///
/// Returns an error if rewriting a symlink fails.
pub(crate) fn fix_absolute_symlinks(old_prefix: &Path, new_root: &Path) -> io::Result<()> {
    for entry in walkdir::WalkDir::new(new_root)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(target) = fs::read_link(path) else {
            continue;
        };
        let Ok(suffix) = target.strip_prefix(old_prefix) else {
            continue;
        };
        let Some(link_dir) = path.parent() else {
            continue;
        };

        let relative = relative_path(link_dir, &new_root.join(suffix));
        fs::remove_file(path)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&relative, path)?;
    }

    Ok(())
}

/// Compute a relative path from `from_dir` to `to_path`.
///
/// Example: `relative_path("/a/b/c", "/a/b/d/e")` returns `"../d/e"`.
pub(crate) fn relative_path(from_dir: &Path, to_path: &Path) -> PathBuf {
    let from_components: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to_path.components().collect();

    let common_len = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common_len..from_components.len() {
        result.push("..");
    }
    for part in &to_components[common_len..] {
        result.push(part);
    }
    result
}

/// Recursively copy the contents of `src` into `dst`.
///
/// # Errors
///
/// Returns an error if any file or directory cannot be copied.
pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs_extra::dir::copy(
        src,
        dst,
        &fs_extra::dir::CopyOptions::new()
            .content_only(true)
            .overwrite(true),
    )
    .map(|_| ())
    .map_err(|e| io::Error::other(format!("copy {} failed: {e}", src.display())))
}

/// Read the last `n` lines of a file without loading all of it.
fn read_last_lines(path: &Path, n: usize) -> io::Result<String> {
    use std::io::{Read, Seek, SeekFrom};

    const TAIL_SIZE: u64 = 16 * 1024;

    let mut file = fs::File::open(path)?;
    let file_len = file.metadata()?.len();

    let seek_pos = file_len.saturating_sub(TAIL_SIZE);
    file.seek(SeekFrom::Start(seek_pos))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let buffer = String::from_utf8_lossy(&bytes);

    // Seeking mid-file leaves a partial first line
    let content = if seek_pos > 0 {
        buffer.find('\n').map_or(&*buffer, |idx| &buffer[idx + 1..])
    } else {
        &*buffer
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].join("\n"))
}
