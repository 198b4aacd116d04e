//! volstore CLI
//!
//! Command-line tools for volstore volume maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display volume statistics
//! - `create` / `seal` - Manage volume lifecycle
//! - `put` / `get` / `delete` - Needle access
//! - `check` / `compact` / `commit` / `cleanup` - Individual vacuum phases
//! - `vacuum` - Run all phases when the garbage ratio reaches a threshold
//! - `upload` - Archive a sealed volume to an object store directory

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// volstore command-line volume tools.
#[derive(Parser)]
#[command(name = "volstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the volume directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Needle alignment unit in bytes
    #[arg(global = true, long, default_value_t = 8)]
    alignment: u64,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display volume statistics
    Inspect {
        /// Volume id
        volume: u32,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Create an empty volume
    Create {
        /// Volume id
        volume: u32,
    },

    /// Store a file as a needle
    Put {
        /// Volume id
        volume: u32,
        /// Needle id (decimal or 0x-prefixed hex)
        #[arg(value_parser = commands::parse_needle_id)]
        needle: u64,
        /// File holding the needle data
        file: PathBuf,
    },

    /// Print a needle's data
    Get {
        /// Volume id
        volume: u32,
        /// Needle id (decimal or 0x-prefixed hex)
        #[arg(value_parser = commands::parse_needle_id)]
        needle: u64,
        /// Write the data to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a needle
    Delete {
        /// Volume id
        volume: u32,
        /// Needle id (decimal or 0x-prefixed hex)
        #[arg(value_parser = commands::parse_needle_id)]
        needle: u64,
    },

    /// Report the garbage ratio
    Check {
        /// Volume id
        volume: u32,
    },

    /// Compact live needles into the next generation
    Compact {
        /// Volume id
        volume: u32,
        /// Size hint for the new data file
        #[arg(long, default_value = "0")]
        preallocate: u64,
    },

    /// Make a finished compaction current
    Commit {
        /// Volume id
        volume: u32,
    },

    /// Remove generation files no longer served
    Cleanup {
        /// Volume id
        volume: u32,
    },

    /// Check, and compact, commit and clean up above a threshold
    Vacuum {
        /// Volume id
        volume: u32,
        /// Garbage ratio that triggers compaction
        #[arg(short, long, default_value = "0.3")]
        threshold: f64,
    },

    /// Seal a volume against further writes
    Seal {
        /// Volume id
        volume: u32,
    },

    /// Upload a sealed volume to an object store directory
    Upload {
        /// Volume id
        volume: u32,
        /// Root directory of the object store
        #[arg(long)]
        store: PathBuf,
        /// Destination bucket
        #[arg(long)]
        bucket: String,
        /// Destination key
        #[arg(long)]
        key: String,
        /// Storage class of the object
        #[arg(long)]
        storage_class: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("volstore CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.path.ok_or("Volume directory required (--path)")?;
    let ctx = commands::Context::new(path, cli.alignment)?;

    match cli.command {
        Commands::Inspect { volume, format } => commands::inspect::run(&ctx, volume, &format)?,
        Commands::Create { volume } => commands::volume::create(&ctx, volume)?,
        Commands::Seal { volume } => commands::volume::seal(&ctx, volume)?,
        Commands::Put {
            volume,
            needle,
            file,
        } => commands::needle::put(&ctx, volume, needle, &file)?,
        Commands::Get {
            volume,
            needle,
            output,
        } => commands::needle::get(&ctx, volume, needle, output.as_deref())?,
        Commands::Delete { volume, needle } => commands::needle::delete(&ctx, volume, needle)?,
        Commands::Check { volume } => commands::vacuum::check(&ctx, volume)?,
        Commands::Compact {
            volume,
            preallocate,
        } => commands::vacuum::compact(&ctx, volume, preallocate)?,
        Commands::Commit { volume } => commands::vacuum::commit(&ctx, volume)?,
        Commands::Cleanup { volume } => commands::vacuum::cleanup(&ctx, volume)?,
        Commands::Vacuum { volume, threshold } => commands::vacuum::run(&ctx, volume, threshold)?,
        Commands::Upload {
            volume,
            store,
            bucket,
            key,
            storage_class,
        } => commands::upload::run(&ctx, volume, &store, &bucket, &key, storage_class)?,
        Commands::Version => {}
    }

    Ok(())
}
