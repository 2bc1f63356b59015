//! Backup and restore commands.
//!
//! Backups run through the context's orchestrator on its I/O pool while
//! this thread prints phase transitions as they arrive.

use super::{require_confirmation, Output};
use bistro_core::backup::BackupEntry;
use bistro_core::concurrency::TaskHandle;
use bistro_core::{AppContext, BackupFormat, BackupOutcome, CoreResult, PhaseEvent, RestoreRequest};
use std::sync::mpsc::Receiver;
use std::time::Duration;

fn print_event(event: &PhaseEvent) {
    eprintln!("  [{}] {}", event.phase, event.message);
}

/// Waits for `task`, echoing phase events until it finishes.
fn follow<T>(
    mut task: TaskHandle<T>,
    events: &Receiver<PhaseEvent>,
    output: Output,
) -> CoreResult<T> {
    loop {
        match task.join_timeout(Duration::from_millis(100)) {
            Ok(result) => {
                for event in events.try_iter() {
                    if output == Output::Text {
                        print_event(&event);
                    }
                }
                return result;
            }
            Err(pending) => {
                for event in events.try_iter() {
                    if output == Output::Text {
                        print_event(&event);
                    }
                }
                task = pending;
            }
        }
    }
}

fn print_outcome(outcome: &BackupOutcome) {
    match outcome {
        BackupOutcome::Success => {}
        BackupOutcome::Warning(message) => println!("  ⚠ {message}"),
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Writes a new backup.
pub fn create(
    ctx: &AppContext,
    label: &str,
    format: Option<BackupFormat>,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let events = ctx.backup().subscribe();
    let task = ctx.backup().create_backup_async(label, format)?;
    let report = follow(task, &events, output)?;

    output.emit(&report, |r| {
        let mark = if r.outcome.is_warning() { "⚠" } else { "✓" };
        println!("{mark} Backup written");
        println!("  File:     {}", r.file_name);
        println!("  Format:   {}", r.format);
        println!("  Size:     {}", format_size(r.size));
        println!("  Duration: {:.1}s", r.duration.as_secs_f64());
        print_outcome(&r.outcome);
    })
}

/// Lists backups, newest first.
pub fn list(ctx: &AppContext, output: Output) -> Result<(), Box<dyn std::error::Error>> {
    let backups = ctx.backup().list_backups()?;
    output.emit(&backups, |all: &Vec<BackupEntry>| {
        if all.is_empty() {
            println!("No backups in {}", ctx.backup().config().backup_dir.display());
            return;
        }
        for b in all {
            println!(
                "  {:<48} {:<7} {:>10}  {}",
                b.name,
                b.format.to_string(),
                format_size(b.size),
                b.modified
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M")
            );
        }
    })
}

/// Deletes a backup file.
pub fn delete(ctx: &AppContext, name: &str, yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    require_confirmation(yes, "deleting a backup")?;
    ctx.backup().delete_backup(name)?;
    println!("✓ Deleted {name}");
    Ok(())
}

/// Replaces the database contents with a backup.
pub fn restore(
    ctx: &AppContext,
    name: &str,
    yes: bool,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    require_confirmation(yes, "restoring replaces all current data and")?;
    let events = ctx.backup().subscribe();
    let task = ctx
        .backup()
        .restore_async(RestoreRequest::new(name).confirm())?;
    let report = follow(task, &events, output)?;

    output.emit(&report, |r| {
        let mark = if r.outcome.is_warning() { "⚠" } else { "✓" };
        println!("{mark} Restored {}", r.file_name);
        println!("  Restaurants: {}", r.loaded.restaurants);
        println!("  Reviews:     {}", r.loaded.reviews);
        if r.loaded.ratings_fixed > 0 {
            println!("  Ratings corrected: {}", r.loaded.ratings_fixed);
        }
        println!("  Duration:    {:.1}s", r.duration.as_secs_f64());
        print_outcome(&r.outcome);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }
}
