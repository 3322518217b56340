//! Formula option flags (`--with-X`, `--without-X`, `--enable-X`, `--disable-X`).
//!
//! clap cannot declare open-ended flag families, so these are split off the
//! argument list before parsing and turned into an [`OptionSelection`].

use mash_core::{ManifestSet, OptionSelection};
use mash_schema::{BuildMode, PackageName};

use crate::BuildArgs;

/// One formula option toggle from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionFlag {
    /// Canonical option name (`with-qt`, `enable-spam`, `universal`).
    pub option: String,
    /// On or off.
    pub enabled: bool,
}

impl OptionFlag {
    /// Recognize an option flag. `--without-X` turns `with-X` off and
    /// `--disable-X` turns `enable-X` off.
    pub fn parse(arg: &str) -> Option<Self> {
        let flag = arg.strip_prefix("--")?;
        let (option, enabled) = if let Some(rest) = flag.strip_prefix("without-") {
            (format!("with-{rest}"), false)
        } else if let Some(rest) = flag.strip_prefix("disable-") {
            (format!("enable-{rest}"), false)
        } else if flag.starts_with("with-") || flag.starts_with("enable-") {
            (flag.to_string(), true)
        } else {
            return None;
        };
        (!option.ends_with('-')).then_some(Self { option, enabled })
    }
}

/// Split option flags off `args`, keeping everything else in order.
pub fn split_option_flags(args: impl IntoIterator<Item = String>) -> (Vec<String>, Vec<OptionFlag>) {
    let mut rest = Vec::new();
    let mut flags = Vec::new();
    for arg in args {
        match OptionFlag::parse(&arg) {
            Some(flag) => flags.push(flag),
            None => rest.push(arg),
        }
    }
    (rest, flags)
}

/// Build the selection for `targets`.
///
/// Each flag applies to every target that declares the option. A flag no
/// target declares is applied to all of them, so resolution reports it as
/// an unknown option instead of silently dropping it.
pub fn selection(
    manifests: &ManifestSet,
    targets: &[PackageName],
    flags: &[OptionFlag],
    build: &BuildArgs,
) -> OptionSelection {
    let mut selection = OptionSelection::new();

    let universal = build.universal.then(|| OptionFlag {
        option: "universal".to_string(),
        enabled: true,
    });
    for flag in flags.iter().chain(universal.as_ref()) {
        let declaring: Vec<&PackageName> = targets
            .iter()
            .filter(|t| {
                manifests
                    .get(t.as_str())
                    .is_some_and(|m| m.declares_option(&flag.option))
            })
            .collect();
        let apply_to = if declaring.is_empty() {
            targets.iter().collect()
        } else {
            declaring
        };
        for target in apply_to {
            selection.set(target, flag.option.clone(), flag.enabled);
        }
    }

    let mode = if build.head {
        BuildMode::Head
    } else if build.devel {
        BuildMode::Devel
    } else {
        BuildMode::Stable
    };
    for target in targets {
        selection.set_mode(target, mode);
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use mash_schema::Manifest;

    #[test]
    fn parses_flag_families() {
        let flag = |s: &str| OptionFlag::parse(s).map(|f| (f.option, f.enabled));
        assert_eq!(flag("--with-qt"), Some(("with-qt".to_string(), true)));
        assert_eq!(flag("--without-qt"), Some(("with-qt".to_string(), false)));
        assert_eq!(flag("--enable-spam"), Some(("enable-spam".to_string(), true)));
        assert_eq!(flag("--disable-spam"), Some(("enable-spam".to_string(), false)));
        assert_eq!(flag("--jobs"), None);
        assert_eq!(flag("--with-"), None);
        assert_eq!(flag("with-qt"), None);
    }

    #[test]
    fn split_keeps_other_arguments_in_order() {
        let args = ["mash", "install", "--with-x", "a", "--jobs", "2", "b"]
            .into_iter()
            .map(String::from);
        let (rest, flags) = split_option_flags(args);
        assert_eq!(rest, vec!["mash", "install", "a", "--jobs", "2", "b"]);
        assert_eq!(flags.len(), 1);
    }

    #[test]
    fn flags_go_to_declaring_targets() {
        let formula = |name: &str, options: &str| {
            Manifest::load(&format!(
                "[package]\nname = \"{name}\"\nversion = \"1.0\"\n\
                 [source]\nurl = \"https://example.com/{name}-1.0.tar.gz\"\nunverified = true\n\
                 [head]\nurl = \"https://example.com/{name}.git\"\n{options}"
            ))
            .unwrap()
        };
        let manifests = ManifestSet::from_manifests([
            formula("a", "[[options]]\nname = \"with-qt\"\n"),
            formula("b", ""),
        ])
        .unwrap();
        let targets = vec![PackageName::new("a"), PackageName::new("b")];
        let flags = vec![OptionFlag::parse("--with-qt").unwrap()];
        let build = BuildArgs {
            head: true,
            ..BuildArgs::default()
        };

        let selection = selection(&manifests, &targets, &flags, &build);
        assert_eq!(selection.explicit(&targets[0], "with-qt"), Some(true));
        assert_eq!(selection.explicit(&targets[1], "with-qt"), None);
        assert_eq!(selection.mode(&targets[1]), BuildMode::Head);
    }
}
