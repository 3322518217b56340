//! End-to-end tests for the mash command-line interface.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// A temporary mash home with a formula directory.
struct TestContext {
    temp_dir: TempDir,
    home: PathBuf,
    formula_dir: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let home = temp_dir.path().join(".mash");
        let formula_dir = temp_dir.path().join("formula");
        std::fs::create_dir_all(&formula_dir).expect("failed to create formula dir");
        Self {
            temp_dir,
            home,
            formula_dir,
        }
    }

    /// Add a formula whose source is a single script fetched without unpacking.
    fn script_formula(&self, name: &str, extra: &str) {
        self.script_formula_with(name, "", extra);
    }

    /// Like `script_formula`, with extra keys in the `[package]` table.
    fn script_formula_with(&self, name: &str, package_extra: &str, extra: &str) {
        let script = self.temp_dir.path().join(format!("{name}.sh"));
        std::fs::write(&script, format!("#!/bin/sh\necho {name}\n")).unwrap();
        let sha = hex::encode(Sha256::digest(std::fs::read(&script).unwrap()));
        let manifest = format!(
            "[package]\nname = \"{name}\"\nversion = \"1.0\"\ndescription = \"The {name} tool\"\n{package_extra}\
             [source]\nurl = \"{}\"\nsha256 = \"{sha}\"\nusing = \"nounzip\"\n\
             [[steps]]\nmkdir = \"{{bin}}\"\n\
             [[steps]]\ninstall = \"{name}.sh\"\ninto = \"{{bin}}\"\n{extra}",
            file_url(&script)
        );
        std::fs::write(self.formula_dir.join(format!("{name}.toml")), manifest).unwrap();
    }

    fn mash(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_mash"))
            .env("HOME", self.temp_dir.path())
            .env("MASH_HOME", &self.home)
            .env("MASH_FORMULA_DIR", &self.formula_dir)
            .env_remove("RUST_LOG")
            .args(args)
            .output()
            .expect("failed to run mash")
    }
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.mash(&["--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Usage:"));
}

#[test]
fn test_plan_lists_build_order() {
    let ctx = TestContext::new();
    ctx.script_formula("libfoo", "");
    ctx.script_formula("app", "[[dependencies]]\nname = \"libfoo\"\n");

    let output = ctx.mash(&["plan", "app"]);
    assert!(output.status.success(), "{output:?}");
    let text = stdout(&output);
    let lib = text.find("libfoo").unwrap();
    let app = text.find("app").unwrap();
    assert!(lib < app);
}

#[test]
fn test_plan_unknown_formula_fails() {
    let ctx = TestContext::new();
    let output = ctx.mash(&["plan", "nowhere"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("nowhere"));
}

#[test]
fn test_unknown_option_fails() {
    let ctx = TestContext::new();
    ctx.script_formula("tool", "");
    let output = ctx.mash(&["plan", "tool", "--with-nothing"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_install_then_uninstall() {
    let ctx = TestContext::new();
    ctx.script_formula("tool", "");

    let output = ctx.mash(&["install", "tool"]);
    assert!(output.status.success(), "{output:?}");
    assert!(ctx.home.join("opt/tool/bin/tool.sh").is_file());

    let list = ctx.mash(&["list"]);
    assert!(stdout(&list).contains("tool"));

    let cached = ctx.mash(&["cache", "list"]);
    assert!(stdout(&cached).contains("tool"));
    assert!(ctx.mash(&["cache", "verify"]).status.success());

    let output = ctx.mash(&["uninstall", "tool"]);
    assert!(output.status.success());
    assert!(!ctx.home.join("opt/tool").exists());
    assert_eq!(ctx.mash(&["uninstall", "tool"]).status.code(), Some(1));
}

#[test]
fn test_partial_install_exits_two() {
    let ctx = TestContext::new();
    ctx.script_formula("broken", "[[steps]]\nrun = [\"false\"]\n");
    ctx.script_formula(
        "viewer",
        "[[dependencies]]\nname = \"broken\"\nkind = \"recommended\"\n",
    );
    ctx.script_formula("other", "");

    let output = ctx.mash(&["install", "viewer", "other"]);
    assert_eq!(output.status.code(), Some(2), "{output:?}");
    assert!(ctx.home.join("opt/other").exists());
    assert!(!ctx.home.join("opt/viewer").exists());
}

#[test]
fn test_info_shows_formula() {
    let ctx = TestContext::new();
    ctx.script_formula_with("tool", "caveats = \"Add it to your PATH.\"\n", "");
    let output = ctx.mash(&["info", "tool"]);
    assert!(output.status.success(), "{output:?}");
    let text = stdout(&output);
    assert!(text.contains("The tool tool"));
    assert!(text.contains("Add it to your PATH."));
    assert!(text.contains("not installed"));
}
