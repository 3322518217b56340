//! Column-aligned rows for `mash list`, `mash info` and `mash cache list`.

use crossterm::style::Stylize;

const NAME_WIDTH: usize = 20;
const VERSION_WIDTH: usize = 14;

/// Print column headers.
pub fn print_list_header(columns: &[&str]) {
    let header = match columns {
        [name, version, rest @ ..] => format!(
            "  {name:<NAME_WIDTH$} {version:<VERSION_WIDTH$} {}",
            rest.join("   ")
        ),
        _ => format!("  {}", columns.join(" ")),
    };
    println!();
    println!("{}", header.dark_grey());
}

/// Print a single row: name, version, then free-form columns.
pub fn print_list_row(name: &str, version: &str, rest: &[String]) {
    let name_part = format!("{name:<NAME_WIDTH$}");
    let version_part = format!("{version:<VERSION_WIDTH$}");
    println!(
        "  {} {} {}",
        name_part.white().bold(),
        version_part.cyan(),
        rest.join("   ").dark_grey()
    );
}

/// Print a footer line.
pub fn print_list_footer(msg: &str) {
    println!();
    println!("  {}", msg.dark_grey());
}
