//! Geocode cache management.

use clap::Subcommand;
use console::style;

use crate::config::Settings;
use crate::geocode::GeocodeCache;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Drop all cached geocode results for a region
    Invalidate {
        /// Region whose cache entries should be removed
        region: String,
    },
    /// Show cached entry counts for a region
    Show {
        region: String,
    },
}

pub fn cmd_cache(settings: &Settings, command: CacheCommands) -> anyhow::Result<()> {
    let cache = GeocodeCache::open(&settings.database_path)?;
    match command {
        CacheCommands::Invalidate { region } => {
            let removed = cache.invalidate_region(&region)?;
            println!(
                "{} removed {removed} cached entries for {region}",
                style("✓").green()
            );
        }
        CacheCommands::Show { region } => {
            println!("{region}: {} cached entries", cache.count(&region)?);
        }
    }
    Ok(())
}
