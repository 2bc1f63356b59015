//! Restaurant commands.

use super::{require_confirmation, Output};
use bistro_core::AppContext;
use bistro_store::{Restaurant, Review};
use serde::Serialize;
use tracing::info;

/// A restaurant with its reviews, for `show`.
#[derive(Debug, Serialize)]
pub struct RestaurantDetail {
    /// The restaurant.
    #[serde(flatten)]
    pub restaurant: Restaurant,
    /// Its reviews, oldest first.
    pub reviews: Vec<Review>,
}

fn print_row(r: &Restaurant) {
    println!(
        "  {:<30} {:<24} {:.2}",
        r.name(),
        r.location(),
        r.rating()
    );
}

/// Adds a restaurant.
pub fn add(
    ctx: &AppContext,
    name: &str,
    location: &str,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let saved = ctx.restaurants().add(Restaurant::new(name, location)?)?;
    output.emit(&saved, |r| println!("✓ Added {} ({})", r.name(), r.location()))
}

/// Lists every restaurant by name.
pub fn list(ctx: &AppContext, output: Output) -> Result<(), Box<dyn std::error::Error>> {
    let restaurants = ctx.restaurants().list();
    output.emit(&restaurants, |all| {
        if all.is_empty() {
            println!("No restaurants.");
            return;
        }
        println!("  {:<30} {:<24} Rating", "Name", "Location");
        for r in all {
            print_row(r);
        }
    })
}

/// Shows one restaurant and its reviews.
pub fn show(
    ctx: &AppContext,
    name: &str,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let restaurant = ctx
        .restaurants()
        .get(name)
        .ok_or_else(|| format!("restaurant not found: {name}"))?;
    let mut reviews = ctx.reviews().for_restaurant(name);
    reviews.sort_by_key(Review::created_at);

    let detail = RestaurantDetail {
        restaurant,
        reviews,
    };
    output.emit(&detail, |d| {
        println!("{}", d.restaurant.name());
        println!("  Location: {}", d.restaurant.location());
        println!(
            "  Rating:   {:.2} ({} review(s))",
            d.restaurant.rating(),
            d.reviews.len()
        );
        for review in &d.reviews {
            let id = review.id().map(|id| id.to_string()).unwrap_or_default();
            println!(
                "  #{id:<5} {}/5  {}  {}",
                review.rating(),
                review.created_at().format("%Y-%m-%d %H:%M"),
                review.comment()
            );
        }
    })
}

/// Renames and/or relocates a restaurant.
pub fn update(
    ctx: &AppContext,
    name: &str,
    new_name: Option<&str>,
    location: Option<&str>,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut edited = ctx
        .restaurants()
        .get(name)
        .ok_or_else(|| format!("restaurant not found: {name}"))?;
    if let Some(new_name) = new_name {
        edited.rename(new_name)?;
    }
    if let Some(location) = location {
        edited.relocate(location)?;
    }
    let saved = ctx.restaurants().update(&edited)?;
    output.emit(&saved, |r| println!("✓ Updated {} ({})", r.name(), r.location()))
}

/// Deletes a restaurant and its reviews.
pub fn delete(ctx: &AppContext, name: &str, yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    require_confirmation(yes, "deleting a restaurant and all of its reviews")?;
    let reviews = ctx.restaurants().delete(name)?;
    info!(restaurant = %name, reviews, "deleted from CLI");
    println!("✓ Deleted {name} and {reviews} review(s)");
    Ok(())
}
