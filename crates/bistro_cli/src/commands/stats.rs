//! Statistics command.

use super::Output;
use bistro_core::AppContext;

/// Prints counts and rating figures.
pub fn execute(ctx: &AppContext, output: Output) -> Result<(), Box<dyn std::error::Error>> {
    let stats = ctx.statistics();
    output.emit(&stats, |s| {
        println!("Restaurants:    {}", s.restaurant_count);
        println!("Reviews:        {}", s.review_count);
        println!("Average rating: {:.2}", s.average_rating);
        if let (Some(low), Some(high)) = (s.lowest_rating, s.highest_rating) {
            println!("Rating range:   {low} to {high}");
        }
        if !s.reviews_by_location.is_empty() {
            println!("Reviews by location:");
            for (location, count) in &s.reviews_by_location {
                println!("  {location:<30} {count}");
            }
        }
    })
}
