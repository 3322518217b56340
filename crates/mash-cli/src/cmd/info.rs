//! Info command

use anyhow::{Result, bail};
use crossterm::style::Stylize;
use mash_schema::PackageName;

use super::Context;

/// Show a formula's metadata and its installed kegs.
pub fn info(ctx: &Context, name: &str) -> Result<()> {
    let package = PackageName::new(name);
    let manifests = ctx.manifests()?;
    let kegs = ctx.kegs();
    let installed = kegs.kegs_of(&package)?;
    let Some(manifest) = manifests.get(name) else {
        if installed.is_empty() {
            bail!("No formula named '{name}'");
        }
        println!();
        println!("  {} (formula no longer available)", name.white().bold());
        print_kegs(ctx, &package, &installed);
        return Ok(());
    };

    let lw = 12;
    println!();
    println!(
        "  {} {}",
        manifest.name.as_str().white().bold(),
        manifest.version.as_str().dark_grey()
    );
    if !manifest.description.is_empty() {
        println!("  {}", manifest.description);
    }
    println!();
    if !manifest.homepage.is_empty() {
        println!("  {:<lw$}{}", "homepage", manifest.homepage);
    }
    println!("  {:<lw$}{}", "source", manifest.source.url);
    if let Some(head) = &manifest.head {
        println!("  {:<lw$}{}", "head", head.url);
    }
    if let Some((devel, version)) = &manifest.devel {
        println!("  {:<lw$}{} ({version})", "devel", devel.url);
    }
    if let Some(reason) = &manifest.keg_only {
        println!("  {:<lw$}{reason}", "keg-only");
    }

    let deps: Vec<String> = manifest
        .dependencies
        .iter()
        .filter(|d| d.kind.orders_build())
        .map(|d| format!("{} ({})", d.name, format!("{:?}", d.kind).to_lowercase()))
        .collect();
    if !deps.is_empty() {
        println!("  {:<lw$}{}", "depends on", deps.join(", "));
    }
    let conflicts: Vec<&str> = manifest.conflicts().map(|d| d.name.as_str()).collect();
    if !conflicts.is_empty() {
        println!("  {:<lw$}{}", "conflicts", conflicts.join(", "));
    }

    if !manifest.options.is_empty() {
        println!();
        println!("  {}", "options".dark_grey());
        for option in &manifest.options {
            let default = if option.default { " (default)" } else { "" };
            println!(
                "    --{}{}  {}",
                option.name,
                default.dark_grey(),
                option.description
            );
        }
    }

    if let Some(caveats) = &manifest.caveats {
        println!();
        println!("  {}", "caveats".dark_grey());
        for line in caveats.lines() {
            println!("    {line}");
        }
    }

    print_kegs(ctx, &package, &installed);
    Ok(())
}

fn print_kegs(ctx: &Context, name: &PackageName, installed: &[mash_core::Keg]) {
    println!();
    if installed.is_empty() {
        println!("  {}", "not installed".dark_grey());
        return;
    }
    let linked = ctx.kegs().linked(name).map(|k| k.path);
    for keg in installed {
        let marker = if linked.as_deref() == std::fs::canonicalize(&keg.path).ok().as_deref() {
            "*"
        } else {
            " "
        };
        let enabled: Vec<&str> = keg.receipt.options.enabled().collect();
        let origin = if keg.receipt.from_bottle { "bottle" } else { "source" };
        println!(
            "  {marker} {} {} {}",
            keg.path.display(),
            keg.receipt.installed_at.format("%Y-%m-%d").to_string().dark_grey(),
            origin.dark_grey()
        );
        if !enabled.is_empty() {
            println!("      {}", enabled.join(" ").dark_grey());
        }
    }
}
