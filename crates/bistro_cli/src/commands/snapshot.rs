//! Snapshot export and import commands.

use super::{require_confirmation, Output};
use bistro_core::AppContext;
use std::path::Path;

/// Writes both caches to a JSON file.
pub fn export(
    ctx: &AppContext,
    file: &Path,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = ctx.export_snapshot(file)?;
    output.emit(&report, |r| {
        println!("✓ Exported to {}", r.path.display());
        println!("  Restaurants: {}", r.restaurants);
        println!("  Reviews:     {}", r.reviews);
        println!("  Size:        {} bytes", r.size);
    })
}

/// Replaces all data with a JSON file written by `export`.
pub fn import(
    ctx: &AppContext,
    file: &Path,
    yes: bool,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    require_confirmation(yes, "importing replaces all current data and")?;
    let report = ctx.import_snapshot(file)?;
    output.emit(&report, |r| {
        println!("✓ Imported {}", r.path.display());
        println!(
            "  Snapshot taken: {}",
            r.exported_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
        );
        println!(
            "  Replaced:       {} restaurant(s), {} review(s)",
            r.removed_restaurants, r.removed_reviews
        );
        println!("  Restaurants:    {}", r.loaded.restaurants);
        println!("  Reviews:        {}", r.loaded.reviews);
        if r.loaded.ratings_fixed > 0 {
            println!("  Ratings corrected: {}", r.loaded.ratings_fixed);
        }
    })
}
