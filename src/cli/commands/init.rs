//! Starter config generation.

use std::path::Path;

use console::style;

use crate::config::DEFAULT_CONFIG;

pub fn cmd_init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        println!(
            "{} {} already exists, leaving it untouched",
            style("✗").red(),
            path.display()
        );
        return Ok(());
    }
    std::fs::write(path, DEFAULT_CONFIG)?;
    println!("{} wrote {}", style("✓").green(), path.display());
    println!("  edit the [regions] section, then run: cadastre import --all");
    Ok(())
}
