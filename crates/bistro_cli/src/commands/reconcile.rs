//! Rating reconciliation command.

use super::Output;
use bistro_core::AppContext;
use serde::Serialize;

/// Result of a reconciliation pass.
#[derive(Debug, Serialize)]
pub struct ReconcileResult {
    /// Restaurants checked.
    pub restaurants: usize,
    /// Restaurants whose stored rating was corrected.
    pub corrected: usize,
}

/// Recomputes every restaurant's rating from its reviews.
pub fn execute(ctx: &AppContext, output: Output) -> Result<(), Box<dyn std::error::Error>> {
    let corrected = ctx.ratings().reconcile_all(ctx.reviews())?;
    let result = ReconcileResult {
        restaurants: ctx.restaurants().len(),
        corrected,
    };
    output.emit(&result, |r| {
        if r.corrected == 0 {
            println!("✓ All {} rating(s) consistent", r.restaurants);
        } else {
            println!(
                "✓ Corrected {} of {} rating(s)",
                r.corrected, r.restaurants
            );
        }
    })
}
