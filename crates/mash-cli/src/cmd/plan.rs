//! Plan command

use anyhow::Result;
use crossterm::style::Stylize;

use super::Context;
use crate::BuildArgs;
use crate::options::OptionFlag;

/// Print the build order for `names` without building anything.
pub fn plan(
    ctx: &Context,
    names: &[String],
    build: &BuildArgs,
    flags: &[OptionFlag],
    json: bool,
) -> Result<()> {
    let plan = ctx.plan(names, build, flags)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let kegs = ctx.kegs();
    println!();
    for (i, node) in plan.nodes.iter().enumerate() {
        let installed = kegs
            .find(node.name(), &node.version, &node.fingerprint)
            .is_some();
        let mut tags = Vec::new();
        if node.build_only {
            tags.push("build-only".to_string());
        }
        if installed {
            tags.push("installed".to_string());
        }
        let enabled: Vec<&str> = node.options.enabled().collect();
        if !enabled.is_empty() {
            tags.push(enabled.join(","));
        }

        println!(
            "  {:>3}. {} {} {} {}",
            i + 1,
            node.name().as_str().white().bold(),
            node.version.as_str().cyan(),
            format!("[{} {}]", node.mode, node.fingerprint.short()).dark_grey(),
            tags.join(" ").dark_grey()
        );
        for edge in &node.edges {
            println!("         {} {} ({:?})", "└".dark_grey(), edge.to, edge.kind);
        }
    }
    println!();
    println!(
        "  {}",
        format!("{} formulae for {}", plan.len(), plan.environment.platform_tag()).dark_grey()
    );
    Ok(())
}
