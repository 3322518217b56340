//! Cache commands

use anyhow::{Result, bail};
use mash_core::Reporter;

use super::Context;
use crate::ui::format_size;
use crate::ui::list::{print_list_footer, print_list_header, print_list_row};

/// List cached bottles.
pub fn list(ctx: &Context) -> Result<()> {
    let entries = ctx.cache().list()?;
    if entries.is_empty() {
        println!();
        println!("  The bottle cache is empty.");
        return Ok(());
    }

    print_list_header(&["name", "version", "platform", "options", "size", "created"]);
    let mut total = 0;
    for entry in &entries {
        total += entry.size;
        print_list_row(
            entry.key.name.as_str(),
            entry.key.version.as_str(),
            &[
                entry.key.platform.clone(),
                entry.key.fingerprint.short().to_string(),
                format!("{:>8}", format_size(entry.size)),
                entry.created_at.format("%Y-%m-%d").to_string(),
            ],
        );
    }
    print_list_footer(&format!("{} bottles, {}", entries.len(), format_size(total)));
    Ok(())
}

/// Re-hash every bottle. Fails if any entry is corrupt.
pub fn verify(ctx: &Context) -> Result<()> {
    let problems = ctx.cache().verify()?;
    if problems.is_empty() {
        ctx.output.success("all bottles intact");
        return Ok(());
    }
    for problem in &problems {
        ctx.output.warning(&problem.to_string());
    }
    bail!(
        "{} corrupt cache entries; they are ignored and rebuilt on next install",
        problems.len()
    )
}
