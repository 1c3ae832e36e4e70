#![allow(dead_code)]
#[macro_use]
mod errors;
mod console;
mod history;
mod repl;
mod statement;
mod storage;

use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "minisql", version = VERSION, about = "Tiny single-file B+tree database.")]
struct Cli {
    /// Path to the database file. Created empty when absent.
    #[arg(env = "MINISQL_DB", default_value = "minisql.db")]
    file: PathBuf,
    /// Path to the log file. Logs go to a file so they never interleave
    /// with REPL output.
    #[arg(long, env = "MINISQL_LOG", default_value = "minisql.log")]
    log: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let log_file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&cli.log)
        .expect("Failed to open log file");

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = repl::start(&cli.file) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
