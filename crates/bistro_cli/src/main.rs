//! Bistro CLI
//!
//! Command-line administration for a Bistro database.
//!
//! # Commands
//!
//! - `restaurant` - Add, list, show, update and delete restaurants
//! - `review` - Add, list, update and delete reviews
//! - `backup` - Create, list, delete and restore backups
//! - `reconcile` - Recompute every restaurant's rating from its reviews
//! - `export` / `import` - Write or load a JSON snapshot of all data
//! - `stats` - Counts, rating figures and reviews per location

mod commands;

use bistro_core::{AppContext, BackupConfig, BackupFormat};
use bistro_core::backup::SqliteDialect;
use bistro_store::SqliteBackend;
use clap::{Parser, Subcommand};
use commands::Output;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Bistro restaurant and review administration.
#[derive(Parser)]
#[command(name = "bistro")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database
    #[arg(global = true, long, default_value = "bistro.db")]
    db: PathBuf,

    /// Directory holding backup files
    #[arg(global = true, long, default_value = "backups")]
    backup_dir: PathBuf,

    /// sqlite3 executable used for dumps and restores
    #[arg(global = true, long, default_value = "sqlite3")]
    sqlite3: PathBuf,

    /// Deadline for the external dump tool, in seconds
    #[arg(global = true, long, default_value_t = 600)]
    tool_timeout_secs: u64,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage restaurants
    #[command(subcommand)]
    Restaurant(RestaurantCommand),

    /// Manage reviews
    #[command(subcommand)]
    Review(ReviewCommand),

    /// Manage backups
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Recompute stored ratings from reviews
    Reconcile,

    /// Write all restaurants and reviews to a JSON file
    Export {
        /// Destination file
        file: PathBuf,
    },

    /// Replace all data with a JSON file written by `export`
    Import {
        /// Snapshot file
        file: PathBuf,
        /// Confirm the import
        #[arg(long)]
        yes: bool,
    },

    /// Show counts, rating figures and reviews per location
    Stats,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum RestaurantCommand {
    /// Add a restaurant
    Add {
        /// Unique name
        name: String,
        /// Where it is
        location: String,
    },

    /// List restaurants
    List,

    /// Show a restaurant with its reviews
    Show {
        /// Restaurant name
        name: String,
    },

    /// Rename or relocate a restaurant
    Update {
        /// Current name
        name: String,
        /// New name
        #[arg(long)]
        rename: Option<String>,
        /// New location
        #[arg(long)]
        location: Option<String>,
    },

    /// Delete a restaurant and its reviews
    Delete {
        /// Restaurant name
        name: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ReviewCommand {
    /// Review a restaurant
    Add {
        /// Restaurant name
        restaurant: String,
        /// Rating from 1 to 5
        rating: i64,
        /// Free-text comment
        #[arg(default_value = "")]
        comment: String,
    },

    /// List reviews
    List {
        /// Only reviews of this restaurant
        #[arg(short, long)]
        restaurant: Option<String>,
    },

    /// Edit a review
    Update {
        /// Review id
        id: i64,
        /// New rating
        #[arg(long)]
        rating: Option<i64>,
        /// New comment
        #[arg(long)]
        comment: Option<String>,
    },

    /// Delete a review
    Delete {
        /// Review id
        id: i64,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Write a new backup
    Create {
        /// Label embedded in the file name
        #[arg(default_value = "manual")]
        label: String,
        /// Write a plain SQL dump instead of a custom archive
        #[arg(long)]
        plain: bool,
    },

    /// List backups, newest first
    List,

    /// Delete a backup file
    Delete {
        /// Backup file name
        name: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Replace the database contents with a backup
    Restore {
        /// Backup file name
        name: String,
        /// Confirm the restore
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("bistro {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let output = Output::parse(&cli.format);
    let ctx = build_context(&cli)?;
    ctx.open()?;
    let result = run(&ctx, cli.command, output);
    if !ctx.shutdown() {
        tracing::warn!("background tasks did not stop before the shutdown timeout");
    }
    result
}

fn build_context(cli: &Cli) -> Result<Arc<AppContext>, Box<dyn std::error::Error>> {
    let backend = Arc::new(SqliteBackend::new(&cli.db));
    let dialect = Arc::new(SqliteDialect::new(&cli.db).with_program(&cli.sqlite3));
    let backup = BackupConfig::new(&cli.backup_dir)
        .tool_timeout(Duration::from_secs(cli.tool_timeout_secs));
    Ok(AppContext::builder(backend, dialect)
        .backup_config(backup)
        .build()?)
}

fn run(
    ctx: &AppContext,
    command: Commands,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Restaurant(cmd) => match cmd {
            RestaurantCommand::Add { name, location } => {
                commands::restaurant::add(ctx, &name, &location, output)
            }
            RestaurantCommand::List => commands::restaurant::list(ctx, output),
            RestaurantCommand::Show { name } => commands::restaurant::show(ctx, &name, output),
            RestaurantCommand::Update {
                name,
                rename,
                location,
            } => commands::restaurant::update(
                ctx,
                &name,
                rename.as_deref(),
                location.as_deref(),
                output,
            ),
            RestaurantCommand::Delete { name, yes } => {
                commands::restaurant::delete(ctx, &name, yes)
            }
        },
        Commands::Review(cmd) => match cmd {
            ReviewCommand::Add {
                restaurant,
                rating,
                comment,
            } => commands::review::add(ctx, &restaurant, rating, &comment, output),
            ReviewCommand::List { restaurant } => {
                commands::review::list(ctx, restaurant.as_deref(), output)
            }
            ReviewCommand::Update {
                id,
                rating,
                comment,
            } => commands::review::update(ctx, id, rating, comment.as_deref(), output),
            ReviewCommand::Delete { id } => commands::review::delete(ctx, id),
        },
        Commands::Backup(cmd) => match cmd {
            BackupCommand::Create { label, plain } => {
                let format = plain.then_some(BackupFormat::Plain);
                commands::backup::create(ctx, &label, format, output)
            }
            BackupCommand::List => commands::backup::list(ctx, output),
            BackupCommand::Delete { name, yes } => commands::backup::delete(ctx, &name, yes),
            BackupCommand::Restore { name, yes } => {
                commands::backup::restore(ctx, &name, yes, output)
            }
        },
        Commands::Reconcile => commands::reconcile::execute(ctx, output),
        Commands::Export { file } => commands::snapshot::export(ctx, &file, output),
        Commands::Import { file, yes } => commands::snapshot::import(ctx, &file, yes, output),
        Commands::Stats => commands::stats::execute(ctx, output),
        Commands::Version => Ok(()),
    }
}
