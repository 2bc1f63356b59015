//! Review commands.

use super::Output;
use bistro_core::AppContext;
use bistro_store::{Rating, Review, ReviewId};
use serde::Serialize;

/// A review with its restaurant's display name.
#[derive(Debug, Serialize)]
pub struct ReviewRow {
    /// Restaurant name, looked up by id.
    pub restaurant: Option<String>,
    /// The review.
    #[serde(flatten)]
    pub review: Review,
}

fn row(ctx: &AppContext, review: Review) -> ReviewRow {
    ReviewRow {
        restaurant: ctx.reviews().restaurant_name(&review),
        review,
    }
}

fn print_row(r: &ReviewRow) {
    let id = r.review.id().map(|id| id.to_string()).unwrap_or_default();
    let edited = if r.review.updated_at().is_some() {
        " (edited)"
    } else {
        ""
    };
    println!(
        "  #{id:<5} {:<30} {}/5  {}{edited}",
        r.restaurant.as_deref().unwrap_or("?"),
        r.review.rating(),
        r.review.comment()
    );
}

/// Adds a review.
pub fn add(
    ctx: &AppContext,
    restaurant: &str,
    rating: i64,
    comment: &str,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let review = ctx.reviews().add(restaurant, Rating::new(rating)?, comment)?;
    let rating = ctx
        .restaurants()
        .get(restaurant)
        .map_or(0.0, |r| r.rating());
    output.emit(&row(ctx, review), |r| {
        print_row(r);
        println!("✓ {restaurant} is now rated {rating:.2}");
    })
}

/// Lists reviews, optionally for one restaurant.
pub fn list(
    ctx: &AppContext,
    restaurant: Option<&str>,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let reviews = match restaurant {
        Some(name) => {
            if !ctx.restaurants().contains(name) {
                return Err(format!("restaurant not found: {name}").into());
            }
            ctx.reviews().for_restaurant(name)
        }
        None => ctx.reviews().list(),
    };
    let rows: Vec<ReviewRow> = reviews.into_iter().map(|r| row(ctx, r)).collect();
    output.emit(&rows, |rows| {
        if rows.is_empty() {
            println!("No reviews.");
        }
        for r in rows {
            print_row(r);
        }
    })
}

/// Changes a review's rating and/or comment.
pub fn update(
    ctx: &AppContext,
    id: i64,
    rating: Option<i64>,
    comment: Option<&str>,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    if rating.is_none() && comment.is_none() {
        return Err("nothing to update; pass --rating and/or --comment".into());
    }
    let rating = rating.map(Rating::new).transpose()?;
    let review = ctx.reviews().update(ReviewId::new(id), rating, comment)?;
    output.emit(&row(ctx, review), |r| {
        print_row(r);
        println!("✓ Review updated");
    })
}

/// Deletes a review.
pub fn delete(ctx: &AppContext, id: i64) -> Result<(), Box<dyn std::error::Error>> {
    ctx.reviews().delete(ReviewId::new(id))?;
    println!("✓ Deleted review #{id}");
    Ok(())
}
