//! Install procedure steps and argument templates.
//!
//! A formula's install procedure is an ordered list of steps. Each step is
//! one action: an argv-vector process invocation, an environment mutation
//! or a small filesystem operation. Steps never go through a shell, so
//! paths coming from formulae cannot inject commands.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Condition;

/// Placeholder names understood by [`expand`] (besides `opt:<dep>`).
pub const PLACEHOLDERS: &[&str] = &[
    "prefix",
    "bin",
    "sbin",
    "lib",
    "libexec",
    "include",
    "share",
    "doc",
    "info",
    "man",
    "man1",
    "man2",
    "man3",
    "man4",
    "man5",
    "man6",
    "man7",
    "man8",
    "frameworks",
    "etc",
    "var",
    "buildpath",
    "name",
    "version",
    "jobs",
];

/// Template expansion failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// `{` without a closing `}`.
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),
    /// `}` without an opening `{`.
    #[error("unmatched '}}' in '{0}'")]
    Unmatched(String),
    /// Placeholder the lookup does not know.
    #[error("unknown placeholder '{{{0}}}'")]
    Unknown(String),
}

/// Expand `{placeholder}` references in `template` through `lookup`.
///
/// `{{` and `}}` produce literal braces.
///
/// # Errors
///
/// Returns [`TemplateError`] on malformed braces or when `lookup` returns
/// `None` for a placeholder.
pub fn expand<F>(template: &str, mut lookup: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(TemplateError::Unterminated(template.to_string())),
                    }
                }
                let value = lookup(name.trim()).ok_or_else(|| TemplateError::Unknown(name))?;
                out.push_str(&value);
            }
            '}' => return Err(TemplateError::Unmatched(template.to_string())),
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// One install step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    /// What the step does.
    pub action: StepAction,
    /// Only run when this holds for the owning formula.
    pub when: Option<Condition>,
}

/// The action performed by a [`Step`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Spawn `argv[0]` with the remaining arguments.
    Run {
        /// Program and arguments, each a template.
        argv: Vec<String>,
    },
    /// Change the working directory for subsequent steps.
    Chdir(String),
    /// Create a directory (and parents).
    Mkdir(String),
    /// Set an environment variable for subsequent steps.
    SetEnv {
        /// Variable name.
        var: String,
        /// Value template.
        value: String,
    },
    /// Append to an environment variable (`ENV.append`).
    AppendEnv {
        /// Variable name.
        var: String,
        /// Value template.
        value: String,
        /// Separator placed between the old and new value.
        separator: String,
    },
    /// Prepend to an environment variable (`ENV.prepend_path`).
    PrependEnv {
        /// Variable name.
        var: String,
        /// Value template.
        value: String,
        /// Separator placed between the new and old value.
        separator: String,
    },
    /// Remove an environment variable.
    UnsetEnv(String),
    /// Force serial make (`ENV.deparallelize`).
    Deparallelize,
    /// Regex replace inside a file (`inreplace`).
    Inreplace {
        /// File path template, relative to the working directory.
        file: String,
        /// Regular expression.
        pattern: String,
        /// Replacement template (regex `$1` groups allowed).
        replacement: String,
    },
    /// Copy a file or directory into a prefix location.
    Install {
        /// Source path template, relative to the working directory.
        from: String,
        /// Destination directory template.
        into: String,
        /// Optional new name inside `into`.
        rename: Option<String>,
    },
    /// Fetch an auxiliary resource into the working directory.
    Stage {
        /// Resource name declared under `[[resources]]`.
        resource: String,
        /// Optional destination the staged tree is copied into.
        into: Option<String>,
    },
    /// Emit a warning (`opoo`).
    Warn(String),
}

impl Step {
    /// Short human readable description used in logs and errors.
    pub fn describe(&self) -> String {
        match &self.action {
            StepAction::Run { argv } => argv.join(" "),
            StepAction::Chdir(dir) => format!("cd {dir}"),
            StepAction::Mkdir(dir) => format!("mkdir -p {dir}"),
            StepAction::SetEnv { var, value } => format!("{var}={value}"),
            StepAction::AppendEnv { var, value, .. } => format!("{var}+={value}"),
            StepAction::PrependEnv { var, value, .. } => format!("{var}={value}:${var}"),
            StepAction::UnsetEnv(var) => format!("unset {var}"),
            StepAction::Deparallelize => "deparallelize".to_string(),
            StepAction::Inreplace { file, pattern, .. } => format!("inreplace {file} /{pattern}/"),
            StepAction::Install { from, into, .. } => format!("install {from} -> {into}"),
            StepAction::Stage { resource, .. } => format!("stage {resource}"),
            StepAction::Warn(msg) => format!("warn {msg}"),
        }
    }

    /// Every template string of this step, for validation.
    pub fn templates(&self) -> Vec<&str> {
        match &self.action {
            StepAction::Run { argv } => argv.iter().map(String::as_str).collect(),
            StepAction::Chdir(s) | StepAction::Mkdir(s) | StepAction::Warn(s) => vec![s.as_str()],
            StepAction::SetEnv { value, .. }
            | StepAction::AppendEnv { value, .. }
            | StepAction::PrependEnv { value, .. } => vec![value.as_str()],
            StepAction::Inreplace {
                file, replacement, ..
            } => vec![file.as_str(), replacement.as_str()],
            StepAction::Install { from, into, rename } => {
                let mut t = vec![from.as_str(), into.as_str()];
                t.extend(rename.as_deref());
                t
            }
            StepAction::Stage { into, .. } => into.iter().map(String::as_str).collect(),
            StepAction::UnsetEnv(_) | StepAction::Deparallelize => Vec::new(),
        }
    }
}

/// Wire form of a step: a table with exactly one action key.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    run: Option<Vec<String>>,
    cd: Option<String>,
    mkdir: Option<String>,
    env: Option<String>,
    append_env: Option<String>,
    prepend_env: Option<String>,
    unset_env: Option<String>,
    value: Option<String>,
    separator: Option<String>,
    #[serde(default)]
    deparallelize: bool,
    inreplace: Option<String>,
    pattern: Option<String>,
    replacement: Option<String>,
    install: Option<String>,
    into: Option<String>,
    rename: Option<String>,
    stage: Option<String>,
    warn: Option<String>,
    when: Option<Condition>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let mut actions = Vec::new();

        if let Some(argv) = raw.run {
            if argv.is_empty() {
                return Err("`run` needs at least a program name".to_string());
            }
            actions.push(StepAction::Run { argv });
        }
        if let Some(dir) = raw.cd {
            actions.push(StepAction::Chdir(dir));
        }
        if let Some(dir) = raw.mkdir {
            actions.push(StepAction::Mkdir(dir));
        }

        let value = raw.value.clone();
        let need_value = |key: &str| {
            value
                .clone()
                .ok_or_else(|| format!("`{key}` step needs a `value`"))
        };
        if let Some(var) = raw.env {
            actions.push(StepAction::SetEnv {
                var,
                value: need_value("env")?,
            });
        }
        if let Some(var) = raw.append_env {
            actions.push(StepAction::AppendEnv {
                var,
                value: need_value("append_env")?,
                separator: raw.separator.clone().unwrap_or_else(|| " ".to_string()),
            });
        }
        if let Some(var) = raw.prepend_env {
            actions.push(StepAction::PrependEnv {
                var,
                value: need_value("prepend_env")?,
                separator: raw.separator.clone().unwrap_or_else(|| ":".to_string()),
            });
        }
        if let Some(var) = raw.unset_env {
            actions.push(StepAction::UnsetEnv(var));
        }
        if raw.deparallelize {
            actions.push(StepAction::Deparallelize);
        }
        if let Some(file) = raw.inreplace {
            let pattern = raw
                .pattern
                .ok_or_else(|| "`inreplace` step needs a `pattern`".to_string())?;
            regex::Regex::new(&pattern).map_err(|e| format!("invalid pattern: {e}"))?;
            actions.push(StepAction::Inreplace {
                file,
                pattern,
                replacement: raw.replacement.unwrap_or_default(),
            });
        }
        if let Some(from) = raw.install {
            let into = raw
                .into
                .clone()
                .ok_or_else(|| "`install` step needs an `into` directory".to_string())?;
            actions.push(StepAction::Install {
                from,
                into,
                rename: raw.rename,
            });
        }
        if let Some(resource) = raw.stage {
            actions.push(StepAction::Stage {
                resource,
                into: raw.into,
            });
        }
        if let Some(msg) = raw.warn {
            actions.push(StepAction::Warn(msg));
        }

        if actions.len() != 1 {
            return Err(format!(
                "a step must have exactly one action, found {}",
                actions.len()
            ));
        }

        Ok(Self {
            action: actions.remove(0),
            when: raw.when,
        })
    }
}
