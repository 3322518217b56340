//! List command

use anyhow::Result;
use walkdir::WalkDir;

use super::Context;
use crate::ui::format_size;
use crate::ui::list::{print_list_footer, print_list_header, print_list_row};

/// List installed kegs.
pub fn list(ctx: &Context) -> Result<()> {
    let kegs = ctx.kegs().list()?;
    if kegs.is_empty() {
        println!();
        println!("  No kegs installed.");
        println!("  Run 'mash install <formula>' to get started.");
        return Ok(());
    }

    print_list_header(&["name", "version", "size", "installed"]);
    let mut total_size = 0;
    for keg in &kegs {
        let size = tree_size(&keg.path);
        total_size += size;
        print_list_row(
            keg.name().as_str(),
            keg.version().as_str(),
            &[
                format!("{:>8}", format_size(size)),
                keg.receipt.installed_at.format("%Y-%m-%d").to_string(),
            ],
        );
    }
    print_list_footer(&format!("{} kegs, {}", kegs.len(), format_size(total_size)));
    Ok(())
}

fn tree_size(path: &std::path::Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(std::fs::Metadata::is_file)
        .map(|m| m.len())
        .sum()
}
