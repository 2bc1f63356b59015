//! Stress tests for the Bistro caches.
//!
//! These tests verify behavior under heavy load and concurrent access.

use bistro_core::backup::BackupFormat;
use bistro_core::{mean_rating, AppContext, RestoreRequest};
use bistro_store::{Rating, Restaurant};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct restaurants touched.
    pub restaurant_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            restaurant_count: 10,
        }
    }
}

fn run_threads<F>(config: &StressConfig, op: F) -> StressTestResult
where
    F: Fn(usize, usize) -> bool + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let op = Arc::clone(&op);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let operations = config.operations;
            thread::spawn(move || {
                for i in 0..operations {
                    if op(t, i) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("Stress thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

fn restaurant_name(i: usize) -> String {
    format!("Stress {i}")
}

/// Adds the restaurants a stress run works on. Existing ones are kept.
pub fn seed_restaurants(ctx: &AppContext, config: &StressConfig) {
    for i in 0..config.restaurant_count {
        let name = restaurant_name(i);
        if !ctx.restaurants().contains(&name) {
            ctx.restaurants()
                .add(Restaurant::new(&name, "Load Street").expect("Invalid restaurant"))
                .expect("Failed to seed restaurant");
        }
    }
}

/// Every thread adds and then deletes restaurants with thread-unique names.
///
/// All operations should succeed and the cache should end up as it began.
pub fn stress_concurrent_add_delete(
    ctx: Arc<AppContext>,
    config: &StressConfig,
) -> StressTestResult {
    run_threads(config, move |t, i| {
        let name = format!("Churn {t}-{i}");
        let added = ctx
            .restaurants()
            .add(Restaurant::new(&name, "Nowhere").expect("Invalid restaurant"));
        added.is_ok() && ctx.restaurants().delete(&name).is_ok()
    })
}

/// Threads race to add the same names; exactly one add per name wins.
pub fn stress_duplicate_adds(ctx: Arc<AppContext>, config: &StressConfig) -> StressTestResult {
    let count = config.restaurant_count.max(1);
    run_threads(config, move |_, i| {
        let name = format!("Contested {}", i % count);
        ctx.restaurants()
            .add(Restaurant::new(&name, "Contested Square").expect("Invalid restaurant"))
            .is_ok()
    })
}

/// Threads add, edit and delete reviews on shared restaurants.
pub fn stress_concurrent_reviews(ctx: Arc<AppContext>, config: &StressConfig) -> StressTestResult {
    seed_restaurants(&ctx, config);
    let count = config.restaurant_count.max(1);
    run_threads(config, move |t, i| {
        let name = restaurant_name((t + i) % count);
        let rating = Rating::new((i % 5) as i64 + 1).expect("Rating in range");
        match i % 4 {
            0 | 1 => ctx.reviews().add(&name, rating, "stress").is_ok(),
            2 => match ctx.reviews().for_restaurant(&name).first() {
                Some(review) => review.id().map_or(true, |id| {
                    ctx.reviews().update(id, Some(rating), None).is_ok()
                        || ctx.reviews().get(id).is_none()
                }),
                None => true,
            },
            _ => match ctx.reviews().for_restaurant(&name).last() {
                // Another thread may delete it first.
                Some(review) => review.id().map_or(true, |id| {
                    ctx.reviews().delete(id).is_ok() || ctx.reviews().get(id).is_none()
                }),
                None => true,
            },
        }
    })
}

/// Readers query while one thread keeps reloading the caches.
///
/// Readers must only ever see ratings inside the valid range.
pub fn stress_reads_during_reload(ctx: Arc<AppContext>, config: &StressConfig) -> StressTestResult {
    seed_restaurants(&ctx, config);
    let count = config.restaurant_count.max(1);
    run_threads(config, move |t, i| {
        if t == 0 {
            return ctx.caches().reload_all().is_ok();
        }
        let name = restaurant_name(i % count);
        match ctx.restaurants().get(&name) {
            Some(r) => (0.0..=5.0).contains(&r.rating()),
            None => true,
        }
    })
}

/// Backups run while writers keep mutating the caches.
pub fn stress_backups_under_load(ctx: Arc<AppContext>, config: &StressConfig) -> StressTestResult {
    seed_restaurants(&ctx, config);
    let count = config.restaurant_count.max(1);
    run_threads(config, move |t, i| {
        if t == 0 && i % 10 == 0 {
            return ctx
                .backup()
                .create_backup(&format!("load-{i}"), Some(BackupFormat::Plain))
                .is_ok();
        }
        let rating = Rating::new((i % 5) as i64 + 1).expect("Rating in range");
        ctx.reviews()
            .add(&restaurant_name(i % count), rating, "under load")
            .is_ok()
    })
}

/// Restores the newest backup while readers hammer the caches.
///
/// Readers may see an empty or partial cache mid-restore, never a panic.
pub fn stress_restore_during_reads(
    ctx: Arc<AppContext>,
    config: &StressConfig,
) -> StressTestResult {
    run_threads(config, move |t, i| {
        if t == 0 && i == 0 {
            let latest = ctx
                .backup()
                .list_backups()
                .ok()
                .and_then(|b| b.into_iter().next());
            return latest.is_some_and(|entry| {
                ctx.backup()
                    .restore(RestoreRequest::new(entry.name).confirm())
                    .is_ok()
            });
        }
        let _ = ctx.restaurants().list();
        let _ = ctx.reviews().len();
        true
    })
}

/// Checks every cached rating against the cached reviews.
pub fn ratings_consistent(ctx: &AppContext) -> bool {
    ctx.restaurants().list().iter().all(|r| {
        let mean = mean_rating(
            ctx.reviews()
                .for_restaurant(r.name())
                .iter()
                .map(|rev| rev.rating()),
        );
        (r.rating() - mean).abs() < 1e-9
    })
}
