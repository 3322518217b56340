//! Terminal output.

pub mod list;

use std::io::IsTerminal;

use crossterm::style::Stylize;
use mash_core::Reporter;
use mash_schema::{PackageName, Version};

/// Line-oriented console reporter.
///
/// Colors are used only when stdout is a terminal.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    color: bool,
}

impl Output {
    pub fn new() -> Self {
        Self {
            color: std::io::stdout().is_terminal(),
        }
    }

    fn paint(&self, text: &str, style: fn(&str) -> String) -> String {
        if self.color {
            style(text)
        } else {
            text.to_string()
        }
    }

    /// Print an error line to stderr.
    pub fn error(&self, msg: &str) {
        eprintln!("{} {msg}", self.paint("error:", |s| s.red().bold().to_string()));
    }

    /// Print a success line.
    pub fn success(&self, msg: &str) {
        println!("{} {msg}", self.paint("==>", |s| s.green().bold().to_string()));
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for Output {
    fn section(&self, title: &str) {
        println!();
        println!("{}", self.paint(title, |s| s.white().bold().to_string()));
    }

    fn fetching(&self, name: &PackageName, version: &Version) {
        println!(
            "  {} {name} {}",
            self.paint("fetching", |s| s.cyan().to_string()),
            self.paint(version.as_str(), |s| s.dark_grey().to_string())
        );
    }

    fn building(&self, name: &PackageName, version: &Version) {
        println!(
            "  {} {name} {}",
            self.paint("building", |s| s.cyan().to_string()),
            self.paint(version.as_str(), |s| s.dark_grey().to_string())
        );
    }

    fn step(&self, name: &PackageName, description: &str) {
        tracing::debug!(package = %name, step = description, "step");
    }

    fn done(&self, name: &PackageName, version: &Version, detail: &str) {
        println!(
            "  {} {name} {} {}",
            self.paint("✓", |s| s.green().to_string()),
            self.paint(version.as_str(), |s| s.dark_grey().to_string()),
            self.paint(detail, |s| s.dark_grey().to_string())
        );
    }

    fn failed(&self, name: &PackageName, version: &Version, reason: &str) {
        println!(
            "  {} {name} {}",
            self.paint("✗", |s| s.red().to_string()),
            self.paint(version.as_str(), |s| s.dark_grey().to_string())
        );
        for line in reason.lines() {
            println!("      {line}");
        }
    }

    fn skipped(&self, name: &PackageName, reason: &str) {
        println!(
            "  {} {name} {}",
            self.paint("-", |s| s.yellow().to_string()),
            self.paint(reason, |s| s.dark_grey().to_string())
        );
    }

    fn warning(&self, msg: &str) {
        println!("  {} {msg}", self.paint("warning:", |s| s.yellow().bold().to_string()));
    }

    fn info(&self, msg: &str) {
        println!("  {msg}");
    }
}

/// Human readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
