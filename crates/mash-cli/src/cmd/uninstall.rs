//! Uninstall command

use anyhow::{Context as _, Result, bail};
use mash_core::Reporter;
use mash_schema::PackageName;

use super::Context;

/// Remove every keg of `name` and its `opt/` link.
pub fn uninstall(ctx: &Context, name: &str) -> Result<()> {
    let name = PackageName::new(name);
    let removed = ctx
        .kegs()
        .uninstall(&name)
        .with_context(|| format!("Failed to uninstall {name}"))?;
    if removed.is_empty() {
        bail!("{name} is not installed");
    }
    for keg in &removed {
        ctx.output.info(&format!("removed {}", keg.path.display()));
    }
    ctx.output.success(&format!("uninstalled {name}"));
    Ok(())
}
