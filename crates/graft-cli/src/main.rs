use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "graft")]
#[command(about = "Offline pattern tooling for image dumps")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate pattern text and print its canonical form
    Check {
        /// Pattern text, e.g. "48 8B ?? C1"
        pattern: String,
    },
    /// Scan a dump file for a pattern or a pattern set
    Scan {
        /// Image dump to scan
        file: PathBuf,
        /// Pattern text to search for
        #[arg(short, long, conflicts_with = "set")]
        pattern: Option<String>,
        /// Pattern-set JSON file
        #[arg(short, long)]
        set: Option<PathBuf>,
        /// Restrict the set scan to one entry
        #[arg(short, long, requires = "set")]
        name: Option<String>,
        /// Maximum matches printed per pattern
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// List the entries of a pattern-set JSON file
    Set {
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("graft=info".parse()?))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Check { pattern } => commands::check::run(&pattern),
        Command::Scan {
            file,
            pattern,
            set,
            name,
            limit,
        } => commands::scan::run(
            &file,
            pattern.as_deref(),
            set.as_deref(),
            name.as_deref(),
            limit,
        ),
        Command::Set { file } => commands::set::run(&file),
    }
}
